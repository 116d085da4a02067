//! Slack notifications through an incoming webhook after reset, deploy and
//! backup, or on demand via `notify`.

use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::{Configuration, Settings};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Merged `slack` block: global settings overlaid by the environment's own.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub webhook: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_icon", rename = "icon_emoji")]
    pub icon_emoji: String,
    /// Task kinds that trigger a message; `always` messages ignore it.
    #[serde(default)]
    pub notify_on: Vec<String>,
    /// Link template; `%commit%` is replaced by the deployed version.
    #[serde(default)]
    pub git_web_url: Option<String>,
}

fn default_username() -> String {
    "fabalicious".to_string()
}

fn default_icon() -> String {
    ":robot_face:".to_string()
}

impl SlackConfig {
    /// `None` when neither the settings nor the environment mention slack.
    pub fn load(settings: &Settings, config: &Configuration) -> Result<Option<Self>> {
        let mut merged = Map::new();
        let blocks = [settings.block("slack"), config.block("slack")];
        if blocks.iter().all(Option::is_none) {
            return Ok(None);
        }
        for block in blocks.into_iter().flatten() {
            for (key, value) in block {
                merged.insert(key.clone(), value.clone());
            }
        }

        if !merged.contains_key("webhook") {
            return Err(Error::config_missing_key(
                "slack/webhook",
                Some(config.name().to_string()),
            ));
        }
        serde_json::from_value(Value::Object(merged))
            .map(Some)
            .map_err(|e| Error::config_invalid_value("slack", None, e.to_string()))
    }
}

pub fn should_notify(kind: &str, notify_on: &[String]) -> bool {
    kind == "always" || notify_on.iter().any(|k| k == kind)
}

/// Webhook body with configuration and version fields.
pub fn build_payload(
    slack: &SlackConfig,
    config: &Configuration,
    version: &str,
    message: &str,
) -> Value {
    let branch = config.string("branch").unwrap_or_else(|| "-".to_string());
    let mut fields = vec![
        json!({ "title": "Configuration", "short": true, "value": config.name() }),
        json!({ "title": "Branch / Version", "short": true, "value": format!("{} / {}", branch, version) }),
    ];
    if let Some(url) = &slack.git_web_url {
        fields.push(json!({ "title": "Git", "value": url.replace("%commit%", version) }));
    }

    let mut payload = json!({
        "text": message,
        "username": format!("{} ({})", slack.username, local_user()),
        "icon_emoji": slack.icon_emoji,
        "attachments": [{
            "fallback": message,
            "color": "good",
            "fields": fields,
        }],
    });
    if let Some(channel) = &slack.channel {
        payload["channel"] = Value::from(channel.as_str());
    }
    payload
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Delivers a payload to a webhook.
pub trait Notifier {
    fn post(&self, webhook: &str, payload: &Value) -> Result<()>;
}

pub struct WebhookNotifier;

impl Notifier for WebhookNotifier {
    fn post(&self, webhook: &str, payload: &Value) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("fabalicious/{}", VERSION))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;

        let response = client
            .post(webhook)
            .json(payload)
            .send()
            .map_err(|e| Error::notify_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::notify_failed(format!("webhook answered {}", status)));
        }
        Ok(())
    }
}

pub struct SlackMethod {
    capabilities: Capabilities<Self>,
    notifier: Box<dyn Notifier>,
}

impl Default for SlackMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackMethod {
    pub fn new() -> Self {
        Self::with_notifier(Box::new(WebhookNotifier))
    }

    pub fn with_notifier(notifier: Box<dyn Notifier>) -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("resetFinished", Self::finished)
                .with("deployFinished", Self::finished)
                .with("backupFinished", Self::finished)
                .with("notify", Self::notify),
            notifier,
        }
    }

    fn finished(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let message = match ctx.task {
            "reset" => "Reset finished.",
            "deploy" => "Deployment finished successfully",
            "backup" => "Backup finished",
            _ => return Ok(()),
        };
        if let Err(err) = self.send(ctx, args, ctx.task, message) {
            log_status!("warning", "Slack notification failed: {}", err.message);
        }
        Ok(())
    }

    fn notify(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let message = match args.param("message") {
            Some(message) => message.to_string(),
            None => args.positional.join(" "),
        };
        if message.trim().is_empty() {
            return Err(Error::validation_missing_argument(vec!["message".to_string()]));
        }
        self.send(ctx, args, "always", &message)
    }

    fn send(&self, ctx: &HookContext<'_>, args: &TaskArgs, kind: &str, message: &str) -> Result<()> {
        let Some(slack) = SlackConfig::load(ctx.settings(), ctx.config)? else {
            return Ok(());
        };
        if !should_notify(kind, &slack.notify_on) {
            return Ok(());
        }

        let version = args
            .result("version")
            .map(str::to_string)
            .unwrap_or_else(|| deployed_version(ctx));
        let payload = build_payload(&slack, ctx.config, &version, message);
        self.notifier.post(&slack.webhook, &payload)?;
        log_status!(
            "slack",
            "Slack-notification sent to {}",
            slack.channel.as_deref().unwrap_or("default channel")
        );
        Ok(())
    }
}

/// Ask `git` for the version when the environment uses it.
fn deployed_version(ctx: &HookContext<'_>) -> String {
    if !ctx.config.needs().iter().any(|need| need == "git") {
        return "unknown".to_string();
    }
    let mut lookup = TaskArgs::new();
    match ctx
        .orchestrator
        .call("git", "getVersion", ctx.config, &mut lookup)
    {
        Ok(()) => lookup.result("version").unwrap_or("unknown").to_string(),
        Err(err) => {
            log_status!("slack", "Could not determine version: {}", err.message);
            "unknown".to_string()
        }
    }
}

impl HookProvider for SlackMethod {
    fn method_name(&self) -> &str {
        "slack"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::RecordingExecutor;
    use crate::method::{MethodFactory, MethodRegistry};
    use crate::orchestrator::TaskOrchestrator;
    use crate::ErrorCode;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Sent = Rc<RefCell<Vec<(String, Value)>>>;

    struct RecordingNotifier {
        sent: Sent,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn post(&self, webhook: &str, payload: &Value) -> Result<()> {
            if self.fail {
                return Err(Error::notify_failed("connection refused"));
            }
            self.sent
                .borrow_mut()
                .push((webhook.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn setup(sent: &Sent, fail: bool) -> TaskOrchestrator {
        let settings = match json!({
            "slack": { "webhook": "https://hooks.example.com/T1", "channel": "#deploys", "notifyOn": ["deploy"] }
        }) {
            Value::Object(map) => Settings::from_map(map),
            _ => unreachable!(),
        };
        let sent = sent.clone();
        let mut registry = MethodRegistry::new();
        registry.register(MethodFactory::named("slack", move || {
            Rc::new(SlackMethod::with_notifier(Box::new(RecordingNotifier {
                sent: sent.clone(),
                fail,
            })))
        }));
        TaskOrchestrator::new(registry, Rc::new(RecordingExecutor::new()), settings)
    }

    fn config() -> Configuration {
        Configuration::new("live", &["slack"])
            .with("branch", "main")
            .with("slack", json!({ "gitWebUrl": "https://git.example.com/commit/%commit%" }))
    }

    #[test]
    fn notifies_only_for_configured_tasks() {
        let sent = Sent::default();
        let orchestrator = setup(&sent, false);

        orchestrator
            .run_task(&config(), "reset", &mut TaskArgs::new())
            .unwrap();
        assert!(sent.borrow().is_empty());

        orchestrator
            .run_task(&config(), "deploy", &mut TaskArgs::new())
            .unwrap();
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        let (webhook, payload) = &sent[0];
        assert_eq!(webhook, "https://hooks.example.com/T1");
        assert_eq!(payload["text"], "Deployment finished successfully");
        assert_eq!(payload["channel"], "#deploys");
        assert_eq!(
            payload["attachments"][0]["fields"][1]["value"],
            "main / unknown"
        );
        assert_eq!(
            payload["attachments"][0]["fields"][2]["value"],
            "https://git.example.com/commit/unknown"
        );
    }

    #[test]
    fn finished_hooks_swallow_delivery_failures_but_notify_does_not() {
        let sent = Sent::default();
        let orchestrator = setup(&sent, true);

        orchestrator
            .run_task(&config(), "deploy", &mut TaskArgs::new())
            .unwrap();

        let mut args = TaskArgs::new().with_param("message", "hello");
        let err = orchestrator
            .call("slack", "notify", &config(), &mut args)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotifyFailed);
    }

    #[test]
    fn missing_webhook_is_a_config_error() {
        let config = Configuration::new("live", &["slack"]).with("slack", json!({ "channel": "#x" }));
        let err = SlackConfig::load(&Settings::default(), &config).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissingKey);
        assert_eq!(
            SlackConfig::load(&Settings::default(), &Configuration::new("x", &[])).unwrap(),
            None
        );
    }

    #[test]
    fn always_bypasses_notify_on() {
        assert!(should_notify("always", &[]));
        assert!(!should_notify("reset", &["deploy".to_string()]));
    }
}

use super::{HookContext, Method, Requirement, TaskArgs};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Knows which method names it serves and how to build the method.
pub struct MethodFactory {
    supports: Box<dyn Fn(&str) -> bool>,
    build: Box<dyn Fn(&str) -> Rc<dyn Method>>,
}

impl MethodFactory {
    pub fn new<S, B>(supports: S, build: B) -> Self
    where
        S: Fn(&str) -> bool + 'static,
        B: Fn(&str) -> Rc<dyn Method> + 'static,
    {
        Self {
            supports: Box::new(supports),
            build: Box::new(build),
        }
    }

    /// Factory serving exactly one name.
    pub fn named<B>(name: &'static str, build: B) -> Self
    where
        B: Fn() -> Rc<dyn Method> + 'static,
    {
        Self::new(move |candidate| candidate == name, move |_| build())
    }

    pub fn supports(&self, name: &str) -> bool {
        (self.supports)(name)
    }
}

/// Maps method names to singleton instances for one run.
///
/// The first `get` for a name builds the method from the first factory that
/// supports it; later lookups return the same instance, so a method's internal
/// flags (tunnel established, reentrancy guard) persist across the run.
pub struct MethodRegistry {
    factories: Vec<MethodFactory>,
    cache: RefCell<HashMap<String, Rc<dyn Method>>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Registry with every built-in method.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MethodFactory::named("ssh", || {
            Rc::new(super::ssh::SshMethod::new())
        }));
        registry.register(MethodFactory::named("docker", || {
            Rc::new(super::docker::DockerMethod::new())
        }));
        registry.register(MethodFactory::named("git", || {
            Rc::new(super::git::GitMethod::new())
        }));
        registry.register(MethodFactory::named("composer", || {
            Rc::new(super::composer::ComposerMethod::new())
        }));
        registry.register(MethodFactory::named("drush", || {
            Rc::new(super::drush::DrushMethod::new())
        }));
        registry.register(MethodFactory::named("drupalconsole", || {
            Rc::new(super::drupalconsole::DrupalConsoleMethod::new())
        }));
        registry.register(MethodFactory::named("files", || {
            Rc::new(super::files::FilesMethod::new())
        }));
        registry.register(MethodFactory::named("script", || {
            Rc::new(super::script::ScriptMethod::new())
        }));
        registry.register(MethodFactory::named("slack", || {
            Rc::new(super::slack::SlackMethod::new())
        }));
        registry
    }

    /// Add a factory. Earlier factories win when several support a name.
    pub fn register(&mut self, factory: MethodFactory) {
        self.factories.push(factory);
    }

    pub fn get(&self, name: &str) -> Result<Rc<dyn Method>> {
        if let Some(method) = self.cache.borrow().get(name) {
            return Ok(Rc::clone(method));
        }

        let factory = self
            .factories
            .iter()
            .find(|factory| factory.supports(name))
            .ok_or_else(|| Error::method_unknown(name))?;

        let method = (factory.build)(name);
        self.cache
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&method));
        Ok(method)
    }

    /// Names of the methods built so far.
    #[cfg(test)]
    pub(crate) fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch `ctx.hook` on `method`. Returns whether the hook ran.
    pub fn call(
        &self,
        method: &str,
        ctx: &HookContext<'_>,
        args: &mut TaskArgs,
        requirement: Requirement,
    ) -> Result<bool> {
        // The cache borrow ends here; hooks may re-enter the registry.
        let instance = self.get(method)?;
        match instance.invoke(ctx, args) {
            Some(result) => result.map(|_| true),
            None if requirement == Requirement::Mandatory => {
                Err(Error::method_missing_task(method, ctx.hook))
            }
            None => Ok(false),
        }
    }
}

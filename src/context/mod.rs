//! Role-addressed machine lifecycle management.
//!
//! A [`Context`] maps role names ("board", "build host") to machine classes,
//! creates instances lazily on first request, arbitrates shared and exclusive
//! access, and tears instances down when the last user is done or, with
//! keep-alive, when the outermost activation scope closes.

mod instance;

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::error::{ContextError, Result};
use crate::machine::Machine;

use instance::{InstanceManager, SharedMachine};

/// Creates a machine instance on demand. Receives the context so dependent
/// machines can be requested during construction.
pub type MachineFactory = Rc<dyn Fn(&Context) -> Result<Box<dyn Machine>>>;

/// Context-wide lifecycle policy.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Keep instances alive after their last user instead of tearing them
    /// down. Requires an activation scope, see [`Context::enter`].
    pub keep_alive: bool,
    /// Default for tearing a machine down when a closure run against it
    /// fails, see [`Context::request_with`].
    pub reset_on_error: bool,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOpts {
    /// Tear down a live instance first and start fresh.
    pub reset: bool,
    /// Deny other requests for this machine while the guard is held.
    pub exclusive: bool,
    /// Override of the context-wide `reset_on_error` policy.
    pub reset_on_error: Option<bool>,
}

impl RequestOpts {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }
}

struct ContextInner {
    config: ContextConfig,
    /// role -> class
    roles: IndexMap<String, String>,
    /// Roles bound by a weak registration, replaceable by a non-weak one.
    weak_roles: HashSet<String>,
    /// class -> factory
    factories: IndexMap<String, MachineFactory>,
    /// class -> lifecycle state
    instances: IndexMap<String, InstanceManager>,
    /// Classes in initialization order; teardown walks this in reverse.
    teardown_order: Vec<String>,
    open_scopes: u32,
}

/// Shared handle to a machine registry and its live instances.
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<ContextInner>>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextInner {
                config,
                roles: IndexMap::new(),
                weak_roles: HashSet::new(),
                factories: IndexMap::new(),
                instances: IndexMap::new(),
                teardown_order: Vec::new(),
                open_scopes: 0,
            })),
        }
    }

    /// Register a machine class under one or more roles.
    ///
    /// A weak registration is a default: it never displaces an existing
    /// binding and is itself displaced by a later non-weak one. Two non-weak
    /// registrations for the same role collide.
    pub fn register_machine(
        &self,
        class: &str,
        roles: &[&str],
        weak: bool,
        factory: MachineFactory,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        for &role in roles {
            match inner.roles.get(role) {
                Some(_) if weak => continue,
                Some(bound) if !inner.weak_roles.contains(role) => {
                    let bound = bound.clone();
                    return Err(ContextError::RoleAlreadyBound(format!(
                        "{role} (bound to {bound})"
                    ))
                    .into());
                }
                _ => {}
            }
            inner.roles.insert(role.to_string(), class.to_string());
            if weak {
                inner.weak_roles.insert(role.to_string());
            } else {
                inner.weak_roles.remove(role);
            }
        }
        inner.factories.insert(class.to_string(), factory);
        if !inner.instances.contains_key(class) {
            inner
                .instances
                .insert(class.to_string(), InstanceManager::new(class));
        }
        debug!("registered machine class {class:?} for roles {roles:?}");
        Ok(())
    }

    /// Resolve a role (or a class name used directly) to a class.
    fn resolve(&self, role: &str) -> Result<String> {
        let inner = self.inner.borrow();
        if let Some(class) = inner.roles.get(role) {
            return Ok(class.clone());
        }
        if inner.factories.contains_key(role) {
            return Ok(role.to_string());
        }
        Err(ContextError::UnknownRole(role.to_string()).into())
    }

    /// Request the machine bound to `role`, initializing it if necessary.
    pub fn request(&self, role: &str, opts: &RequestOpts) -> Result<MachineGuard> {
        {
            let inner = self.inner.borrow();
            if inner.config.keep_alive && inner.open_scopes == 0 {
                return Err(ContextError::InactiveContext.into());
            }
        }
        let class = self.resolve(role)?;

        if opts.reset && self.is_alive_class(&class) {
            info!("resetting instance of {class} on request");
            self.teardown_class(&class)?;
        }

        if !self.is_alive_class(&class) {
            self.init_class(&class)?;
        }

        let machine = {
            let mut inner = self.inner.borrow_mut();
            let mgr = inner
                .instances
                .get_mut(&class)
                .ok_or_else(|| ContextError::UnknownRole(class.clone()))?;
            mgr.begin_request(opts.exclusive)?
        };

        Ok(MachineGuard {
            ctx: self.clone(),
            machine,
            class,
            exclusive: opts.exclusive,
        })
    }

    /// Request a machine and run `f` against it.
    ///
    /// When `f` fails and the reset-on-error policy applies, the instance is
    /// torn down so the next request starts from a known state. The original
    /// error is returned unchanged either way.
    pub fn request_with<T>(
        &self,
        role: &str,
        opts: &RequestOpts,
        f: impl FnOnce(&MachineGuard) -> Result<T>,
    ) -> Result<T> {
        let reset_on_error = opts
            .reset_on_error
            .unwrap_or(self.inner.borrow().config.reset_on_error);
        let guard = self.request(role, opts)?;
        let class = guard.class.clone();
        match f(&guard) {
            Ok(value) => Ok(value),
            Err(e) => {
                drop(guard);
                if reset_on_error && self.is_alive_class(&class) {
                    warn!("tearing down {class} after an error: {e}");
                    if let Err(td) = self.teardown_class(&class) {
                        warn!("teardown of {class} after an error also failed: {td}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Activate the context. Keep-alive instances live until the outermost
    /// scope closes.
    pub fn enter(&self) -> ContextScope {
        self.inner.borrow_mut().open_scopes += 1;
        ContextScope { ctx: self.clone() }
    }

    /// Temporarily replace the context configuration.
    ///
    /// Restored when the guard drops; if keep-alive was only on temporarily,
    /// instances that outlived their users are torn down on restore.
    pub fn reconfigure(&self, config: ContextConfig) -> ReconfigureGuard {
        let saved = {
            let mut inner = self.inner.borrow_mut();
            std::mem::replace(&mut inner.config, config)
        };
        ReconfigureGuard {
            ctx: self.clone(),
            saved: Some(saved),
        }
    }

    /// Tear down the instance bound to `role`, if it is alive.
    ///
    /// Returns whether an instance was actually torn down.
    pub fn teardown_if_alive(&self, role: &str) -> Result<bool> {
        let class = self.resolve(role)?;
        if self.is_alive_class(&class) {
            self.teardown_class(&class)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn is_alive_class(&self, class: &str) -> bool {
        self.inner
            .borrow()
            .instances
            .get(class)
            .is_some_and(InstanceManager::is_alive)
    }

    fn init_class(&self, class: &str) -> Result<()> {
        let factory = self
            .inner
            .borrow()
            .factories
            .get(class)
            .cloned()
            .ok_or_else(|| ContextError::UnknownRole(class.to_string()))?;
        // No borrow held here: the factory may request other machines.
        info!("initializing instance of {class}");
        let machine = factory(self)?;

        let mut inner = self.inner.borrow_mut();
        let mgr = inner
            .instances
            .get_mut(class)
            .ok_or_else(|| ContextError::UnknownRole(class.to_string()))?;
        mgr.init(machine)?;
        inner.teardown_order.retain(|c| c != class);
        inner.teardown_order.push(class.to_string());
        Ok(())
    }

    fn teardown_class(&self, class: &str) -> Result<()> {
        let detached = {
            let mut inner = self.inner.borrow_mut();
            let mgr = inner
                .instances
                .get_mut(class)
                .ok_or_else(|| ContextError::UnknownRole(class.to_string()))?;
            mgr.begin_teardown()?
        };
        // Close without holding the registry borrow; teardown code may use
        // the context.
        info!("tearing down instance of {class}");
        let result = detached.borrow_mut().close();
        if let Some(mgr) = self.inner.borrow_mut().instances.get_mut(class) {
            mgr.finish_teardown();
        }
        result
    }

    /// Bookkeeping for a dropped guard.
    fn release(&self, class: &str, exclusive: bool) {
        let teardown = {
            let mut inner = self.inner.borrow_mut();
            let keep_alive = inner.config.keep_alive;
            match inner.instances.get_mut(class) {
                Some(mgr) => mgr.end_request(exclusive, keep_alive),
                None => false,
            }
        };
        if teardown {
            if let Err(e) = self.teardown_class(class) {
                warn!("teardown of {class} failed: {e}");
            }
        }
    }

    /// Outermost-scope cleanup, in reverse initialization order. Under
    /// keep-alive the scope owns its idle instances and tears them down;
    /// without keep-alive a surviving instance belongs to whoever leaked it,
    /// so it is only reported.
    fn close_scope(&self) {
        let (remaining, keep_alive) = {
            let mut inner = self.inner.borrow_mut();
            inner.open_scopes = inner.open_scopes.saturating_sub(1);
            (inner.open_scopes, inner.config.keep_alive)
        };
        if remaining > 0 {
            return;
        }
        let order: Vec<String> = {
            let inner = self.inner.borrow();
            inner.teardown_order.iter().rev().cloned().collect()
        };
        for class in order {
            let (alive, in_use) = {
                let inner = self.inner.borrow();
                match inner.instances.get(&class) {
                    Some(mgr) => (mgr.is_alive(), mgr.has_users()),
                    None => (false, false),
                }
            };
            if !alive {
                continue;
            }
            if in_use {
                warn!("instance of {class} still in use at scope exit, leaking it");
                continue;
            }
            if !keep_alive {
                warn!("instance of {class} dangling at scope exit");
                continue;
            }
            if let Err(e) = self.teardown_class(&class) {
                warn!("teardown of {class} at scope exit failed: {e}");
            }
        }
    }
}

/// Shared access to a requested machine; releases it on drop.
pub struct MachineGuard {
    ctx: Context,
    machine: SharedMachine,
    class: String,
    exclusive: bool,
}

impl MachineGuard {
    /// The machine's class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Run `f` against the machine as its concrete type.
    pub fn with<M: Machine, R>(&self, f: impl FnOnce(&mut M) -> R) -> Result<R> {
        let mut machine = self.machine.borrow_mut();
        let any: &mut dyn std::any::Any = &mut **machine;
        match any.downcast_mut::<M>() {
            Some(concrete) => Ok(f(concrete)),
            None => Err(ContextError::MachineTypeMismatch(self.class.clone()).into()),
        }
    }

    /// Run `f` against the machine through the trait object.
    pub fn with_dyn<R>(&self, f: impl FnOnce(&mut dyn Machine) -> R) -> R {
        let mut machine = self.machine.borrow_mut();
        f(&mut **machine)
    }
}

impl Drop for MachineGuard {
    fn drop(&mut self) {
        self.ctx.release(&self.class, self.exclusive);
    }
}

/// Open activation scope, see [`Context::enter`].
pub struct ContextScope {
    ctx: Context,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.ctx.close_scope();
    }
}

/// Restores the previous configuration on drop, see [`Context::reconfigure`].
pub struct ReconfigureGuard {
    ctx: Context,
    saved: Option<ContextConfig>,
}

impl Drop for ReconfigureGuard {
    fn drop(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        let dropped_keep_alive = {
            let mut inner = self.ctx.inner.borrow_mut();
            let was_keep_alive = inner.config.keep_alive;
            inner.config = saved;
            was_keep_alive && !inner.config.keep_alive
        };
        if !dropped_keep_alive {
            return;
        }
        // Keep-alive ended: userless survivors go down now.
        let order: Vec<String> = {
            let inner = self.ctx.inner.borrow();
            inner.teardown_order.iter().rev().cloned().collect()
        };
        for class in order {
            let idle = {
                let inner = self.ctx.inner.borrow();
                inner
                    .instances
                    .get(&class)
                    .is_some_and(|m| m.is_alive() && !m.has_users())
            };
            if idle {
                if let Err(e) = self.ctx.teardown_class(&class) {
                    warn!("teardown of {class} after reconfigure failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    /// Records lifecycle events into a shared log.
    struct Probe {
        name: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Machine for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn close(&mut self) -> Result<()> {
            self.log.borrow_mut().push(format!("close {}", self.name));
            Ok(())
        }
    }

    fn probe_factory(name: &str, log: &Rc<RefCell<Vec<String>>>) -> MachineFactory {
        let name = name.to_string();
        let log = log.clone();
        Rc::new(move |_ctx| {
            log.borrow_mut().push(format!("init {name}"));
            Ok(Box::new(Probe {
                name: name.clone(),
                log: log.clone(),
            }))
        })
    }

    fn event_log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_lazy_init_and_teardown_after_last_user() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        assert!(log.borrow().is_empty());
        {
            let _a = ctx.request("target", &RequestOpts::default()).unwrap();
            let _b = ctx.request("target", &RequestOpts::default()).unwrap();
            // Second request reuses the live instance.
            assert_eq!(*log.borrow(), vec!["init b0"]);
        }
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
    }

    #[test]
    fn test_request_by_class_name() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let guard = ctx.request("board", &RequestOpts::default()).unwrap();
        assert_eq!(guard.class(), "board");
    }

    #[test]
    fn test_unknown_role() {
        let ctx = Context::new(ContextConfig::default());
        assert!(matches!(
            ctx.request("nonsense", &RequestOpts::default()).map(|_| ()),
            Err(Error::Context(ContextError::UnknownRole(_)))
        ));
    }

    #[test]
    fn test_weak_registration_is_a_default() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("fallback", &["target"], true, probe_factory("weak", &log))
            .unwrap();
        ctx.register_machine("board", &["target"], false, probe_factory("strong", &log))
            .unwrap();
        let guard = ctx.request("target", &RequestOpts::default()).unwrap();
        assert_eq!(guard.class(), "board");
    }

    #[test]
    fn test_nonweak_collision_rejected() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("a", &["target"], false, probe_factory("a", &log))
            .unwrap();
        assert!(matches!(
            ctx.register_machine("b", &["target"], false, probe_factory("b", &log)),
            Err(Error::Context(ContextError::RoleAlreadyBound(_)))
        ));
    }

    #[test]
    fn test_exclusive_request_denies_sharing() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let held = ctx.request("target", &RequestOpts::exclusive()).unwrap();
        assert!(matches!(
            ctx.request("target", &RequestOpts::default()).map(|_| ()),
            Err(Error::Context(ContextError::NotAvailable(_)))
        ));
        drop(held);
    }

    #[test]
    fn test_exclusive_release_tears_down_despite_keep_alive() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let _scope = ctx.enter();
        drop(ctx.request("target", &RequestOpts::exclusive()).unwrap());
        // The exclusive holder may have left the instance in an arbitrary
        // state; it must not be handed to the next requester.
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
        drop(ctx.request("target", &RequestOpts::default()).unwrap());
        assert_eq!(*log.borrow(), vec!["init b0", "close b0", "init b0"]);
    }

    #[test]
    fn test_teardown_if_alive_reports_whether_it_acted() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let _scope = ctx.enter();
        assert!(!ctx.teardown_if_alive("target").unwrap());
        drop(ctx.request("target", &RequestOpts::default()).unwrap());
        assert!(ctx.teardown_if_alive("target").unwrap());
        assert!(!ctx.teardown_if_alive("target").unwrap());
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
    }

    #[test]
    fn test_reset_request_recreates_instance() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        {
            let keep = ctx.request("target", &RequestOpts::default()).unwrap();
            drop(keep);
        }
        let _g = ctx.request("target", &RequestOpts::reset()).unwrap();
        // Second init happens even though teardown already ran in between.
        assert_eq!(
            *log.borrow(),
            vec!["init b0", "close b0", "init b0"]
        );
    }

    #[test]
    fn test_keep_alive_requires_scope() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        assert!(matches!(
            ctx.request("target", &RequestOpts::default()).map(|_| ()),
            Err(Error::Context(ContextError::InactiveContext))
        ));
    }

    #[test]
    fn test_keep_alive_instances_survive_until_scope_exit() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        ctx.register_machine("host", &["builder"], false, probe_factory("h0", &log))
            .unwrap();
        {
            let _scope = ctx.enter();
            drop(ctx.request("target", &RequestOpts::default()).unwrap());
            drop(ctx.request("builder", &RequestOpts::default()).unwrap());
            drop(ctx.request("target", &RequestOpts::default()).unwrap());
            // Still alive, no close events yet.
            assert_eq!(*log.borrow(), vec!["init b0", "init h0"]);
        }
        // Scope exit tears down in reverse initialization order.
        assert_eq!(
            *log.borrow(),
            vec!["init b0", "init h0", "close h0", "close b0"]
        );
    }

    #[test]
    fn test_nested_scopes_only_outermost_cleans_up() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let outer = ctx.enter();
        {
            let _inner = ctx.enter();
            drop(ctx.request("target", &RequestOpts::default()).unwrap());
        }
        assert_eq!(*log.borrow(), vec!["init b0"]);
        drop(outer);
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
    }

    #[test]
    fn test_scope_exit_without_keep_alive_reports_dangling() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        {
            let _scope = ctx.enter();
            // An instance with no users left behind, e.g. by leaked release
            // bookkeeping. Without keep-alive the scope does not own it.
            ctx.init_class("board").unwrap();
        }
        assert_eq!(*log.borrow(), vec!["init b0"]);
    }

    #[test]
    fn test_request_with_reset_on_error() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            reset_on_error: true,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let opts = RequestOpts::default();
        let err = ctx
            .request_with("target", &opts, |_g| -> Result<()> {
                Err(ContextError::NotAlive("simulated".into()).into())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Context(ContextError::NotAlive(_))
        ));
        // Instance went down with the error.
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
    }

    #[test]
    fn test_request_with_override_disables_reset() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            reset_on_error: true,
            keep_alive: false,
            ..Default::default()
        });
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        let opts = RequestOpts {
            reset_on_error: Some(false),
            ..Default::default()
        };
        // Hold a second reference so the guard drop alone does not tear down.
        let keep = ctx.request("target", &RequestOpts::default()).unwrap();
        let _ = ctx
            .request_with("target", &opts, |_g| -> Result<()> {
                Err(ContextError::NotAlive("simulated".into()).into())
            })
            .unwrap_err();
        assert_eq!(*log.borrow(), vec!["init b0"]);
        drop(keep);
    }

    #[test]
    fn test_reconfigure_restores_and_reaps() {
        let log = event_log();
        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine("board", &["target"], false, probe_factory("b0", &log))
            .unwrap();
        {
            let _scope = ctx.enter();
            let _cfg = ctx.reconfigure(ContextConfig {
                keep_alive: true,
                ..Default::default()
            });
            drop(ctx.request("target", &RequestOpts::default()).unwrap());
            // Temporarily kept alive.
            assert_eq!(*log.borrow(), vec!["init b0"]);
        }
        // Guard restored keep_alive = false and reaped the idle instance.
        assert_eq!(*log.borrow(), vec!["init b0", "close b0"]);
    }

    #[test]
    fn test_factory_may_request_dependencies() {
        let log = event_log();
        let ctx = Context::new(ContextConfig {
            keep_alive: true,
            ..Default::default()
        });
        ctx.register_machine("host", &["builder"], false, probe_factory("h0", &log))
            .unwrap();
        let dep_log = log.clone();
        ctx.register_machine(
            "board",
            &["target"],
            false,
            Rc::new(move |ctx| {
                // A board that needs the build host to come up first.
                let _host = ctx.request("builder", &RequestOpts::default())?;
                dep_log.borrow_mut().push("init b0".to_string());
                Ok(Box::new(Probe {
                    name: "b0".to_string(),
                    log: dep_log.clone(),
                }))
            }),
        )
        .unwrap();
        {
            let _scope = ctx.enter();
            drop(ctx.request("target", &RequestOpts::default()).unwrap());
        }
        assert_eq!(
            *log.borrow(),
            vec!["init h0", "init b0", "close b0", "close h0"]
        );
    }

    #[test]
    fn test_with_downcasts_to_concrete_type() {
        struct Counter {
            hits: Cell<u32>,
        }
        impl Machine for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let ctx = Context::new(ContextConfig::default());
        ctx.register_machine(
            "counter",
            &["ticker"],
            false,
            Rc::new(|_| Ok(Box::new(Counter { hits: Cell::new(0) }))),
        )
        .unwrap();
        let guard = ctx.request("ticker", &RequestOpts::default()).unwrap();
        guard
            .with(|c: &mut Counter| c.hits.set(c.hits.get() + 1))
            .unwrap();
        let hits = guard.with(|c: &mut Counter| c.hits.get()).unwrap();
        assert_eq!(hits, 1);
        assert!(matches!(
            guard.with(|_p: &mut Probe| ()),
            Err(Error::Context(ContextError::MachineTypeMismatch(_)))
        ));
    }
}

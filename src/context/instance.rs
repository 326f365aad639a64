//! Per-class instance lifecycle bookkeeping.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::error::{ContextError, Result};
use crate::machine::Machine;

/// A live machine instance shared between the context and its guards.
pub(crate) type SharedMachine = Rc<RefCell<Box<dyn Machine>>>;

/// Tracks one machine class: its live instance, who is using it, and whether
/// a teardown is in flight.
pub(crate) struct InstanceManager {
    class: String,
    instance: Option<SharedMachine>,
    current_users: u32,
    /// False while a request holds the instance exclusively.
    available: bool,
    tearing_down: bool,
}

impl InstanceManager {
    pub fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            instance: None,
            current_users: 0,
            available: false,
            tearing_down: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.instance.is_some()
    }

    pub fn has_users(&self) -> bool {
        self.current_users > 0
    }

    /// Install a freshly created instance.
    pub fn init(&mut self, machine: Box<dyn Machine>) -> Result<SharedMachine> {
        if self.instance.is_some() {
            return Err(ContextError::AlreadyInitialized(self.class.clone()).into());
        }
        debug!("instance of {} initialized", self.class);
        let shared: SharedMachine = Rc::new(RefCell::new(machine));
        self.instance = Some(shared.clone());
        self.current_users = 0;
        self.available = true;
        self.tearing_down = false;
        Ok(shared)
    }

    /// Account for a new request and hand out the instance.
    pub fn begin_request(&mut self, exclusive: bool) -> Result<SharedMachine> {
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| ContextError::NotAlive(self.class.clone()))?;
        if !self.available {
            return Err(ContextError::NotAvailable(self.class.clone()).into());
        }
        self.current_users += 1;
        if exclusive {
            self.available = false;
        }
        Ok(instance.clone())
    }

    /// Account for a finished request. Returns true when the instance must
    /// now be torn down: always after an exclusive request (the holder may
    /// have left it in an arbitrary state), otherwise when the last user
    /// leaves and keep-alive is off.
    pub fn end_request(&mut self, exclusive: bool, keep_alive: bool) -> bool {
        self.current_users = self.current_users.saturating_sub(1);
        if exclusive {
            self.available = true;
        }
        (exclusive || (self.current_users == 0 && !keep_alive)) && self.instance.is_some()
    }

    /// Detach the instance for teardown.
    ///
    /// The instance is removed immediately so that code running during its
    /// teardown observes the class as not alive, and a second teardown
    /// attempt is rejected instead of recursing.
    pub fn begin_teardown(&mut self) -> Result<SharedMachine> {
        if self.tearing_down {
            return Err(ContextError::TeardownReentrancy(self.class.clone()).into());
        }
        let instance = self
            .instance
            .take()
            .ok_or_else(|| ContextError::NotAlive(self.class.clone()))?;
        self.tearing_down = true;
        self.available = false;
        debug!("tearing down instance of {}", self.class);
        Ok(instance)
    }

    pub fn finish_teardown(&mut self) {
        self.tearing_down = false;
    }
}

//! Machine lifecycle.
//!
//! A [`Machine`] is a reference-counted handle to a connected endpoint. Every
//! user enters a [`Scope`] on it; the machine is destroyed exactly once, when
//! the outermost scope exits. Nested scopes on the same machine share its one
//! connection.
//!
//! # Threading
//!
//! The counter is a plain [`Cell`]. Machines are therefore `!Sync` and the
//! scope model only supports re-entrant use from a single thread. Sharing a
//! machine across threads would need a mutex around both the counter and
//! `destroy`.

use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::ops::Deref;

use crate::channel::Channel;
use crate::error::{MachineError, Result};
use crate::shell;

/// Number of live scopes on a machine.
#[derive(Debug, Default)]
pub struct RefCount {
    refs: Cell<usize>,
}

impl RefCount {
    /// Create a counter with no live scopes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refs: Cell::new(0),
        }
    }

    /// Current number of live scopes.
    #[must_use]
    pub fn get(&self) -> usize {
        self.refs.get()
    }

    /// Register a scope and return the new count.
    pub fn acquire(&self) -> usize {
        let refs = self.refs.get() + 1;
        self.refs.set(refs);
        refs
    }

    /// Unregister a scope.
    ///
    /// Returns `true` when this was the last live scope. Releasing with no
    /// live scope is a contract violation reported as
    /// [`MachineError::ScopeUnderflow`]; the counter stays at zero.
    pub fn release(&self, machine: &str) -> Result<bool> {
        match self.refs.get() {
            0 => Err(MachineError::ScopeUnderflow {
                machine: machine.to_string(),
            }),
            refs => {
                self.refs.set(refs - 1);
                Ok(refs == 1)
            }
        }
    }
}

/// A connected endpoint (host, board, ...).
pub trait Machine {
    /// Name of this machine.
    fn name(&self) -> &str;

    /// Scope counter of this machine.
    fn refs(&self) -> &RefCount;

    /// Release the channel and any underlying transport.
    ///
    /// Called by [`Scope`] exactly once per descent of the counter to zero.
    /// Implementations must tolerate resources that were never acquired or
    /// are already released.
    fn destroy(&self) -> Result<()>;

    /// Enter a scope on this machine.
    fn enter(&self) -> Scope<'_, Self>
    where
        Self: Sized,
    {
        Scope::enter(self)
    }
}

/// Exit one scope on `machine`, destroying it if this was the last one.
pub fn exit<M: Machine + ?Sized>(machine: &M) -> Result<()> {
    if machine.refs().release(machine.name())? {
        tracing::debug!(machine = %machine.name(), "Last scope exited, destroying machine");
        machine.destroy()?;
    }
    Ok(())
}

/// A live scope on a machine.
///
/// Prefer [`Scope::exit`], which reports errors from `destroy`. A scope that
/// is simply dropped still exits, but can only log those errors.
#[must_use = "dropping a scope exits it immediately"]
pub struct Scope<'a, M: Machine + ?Sized> {
    machine: &'a M,
    active: bool,
}

impl<'a, M: Machine + ?Sized> Scope<'a, M> {
    /// Enter a scope on `machine`.
    pub fn enter(machine: &'a M) -> Self {
        let refs = machine.refs().acquire();
        tracing::trace!(machine = %machine.name(), refs, "Entered scope");
        Self {
            machine,
            active: true,
        }
    }

    /// The machine this scope is on.
    #[must_use]
    pub const fn machine(&self) -> &'a M {
        self.machine
    }

    /// Exit the scope.
    pub fn exit(mut self) -> Result<()> {
        self.active = false;
        exit(self.machine)
    }
}

impl<M: Machine + ?Sized> Deref for Scope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.machine
    }
}

impl<M: Machine + ?Sized> fmt::Debug for Scope<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("machine", &self.machine.name())
            .field("refs", &self.machine.refs().get())
            .finish()
    }
}

impl<M: Machine + ?Sized> Drop for Scope<'_, M> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = exit(self.machine) {
                tracing::warn!(
                    machine = %self.machine.name(),
                    error = %e,
                    "Failed to destroy machine on scope exit"
                );
            }
        }
    }
}

/// A machine with a shell on its channel that other connectors can build on.
///
/// This is where the connector capability (how the channel was obtained) and
/// the shell capability (how command lines are quoted) meet.
pub trait Host: Machine {
    /// User logged in on this machine.
    fn username(&self) -> &str;

    /// Quote `args` into one command line for this machine's shell.
    fn escape(&self, args: &[&str]) -> String {
        shell::escape(args)
    }

    /// Borrow the machine's channel.
    ///
    /// Fails with [`MachineError::ChannelBusy`] while another caller holds it.
    fn channel(&self) -> Result<RefMut<'_, Channel>>;

    /// Produce an independent machine with its own channel to the same
    /// endpoint, so a second user does not contend for this one's channel.
    fn clone_host(&self) -> Result<Box<dyn Host>>;
}

/// Borrow a machine's channel cell, mapping contention to an error.
pub(crate) fn borrow_channel<'a>(
    cell: &'a RefCell<Channel>,
    machine: &str,
) -> Result<RefMut<'a, Channel>> {
    cell.try_borrow_mut().map_err(|_| MachineError::ChannelBusy {
        machine: machine.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counted {
        refs: RefCount,
        destroyed: Cell<usize>,
        fail: bool,
    }

    impl Counted {
        fn new() -> Self {
            Self {
                refs: RefCount::new(),
                destroyed: Cell::new(0),
                fail: false,
            }
        }
    }

    impl Machine for Counted {
        fn name(&self) -> &str {
            "counted"
        }

        fn refs(&self) -> &RefCount {
            &self.refs
        }

        fn destroy(&self) -> Result<()> {
            self.destroyed.set(self.destroyed.get() + 1);
            if self.fail {
                return Err(MachineError::config("destroy failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn single_scope_destroys_on_exit() {
        let machine = Counted::new();
        let scope = machine.enter();
        assert_eq!(machine.refs().get(), 1);
        scope.exit().unwrap();
        assert_eq!(machine.destroyed.get(), 1);
        assert_eq!(machine.refs().get(), 0);
    }

    #[test]
    fn nested_scopes_share_one_destroy() {
        let machine = Counted::new();
        let outer = machine.enter();
        {
            let inner = machine.enter();
            assert_eq!(machine.refs().get(), 2);
            inner.exit().unwrap();
        }
        assert_eq!(machine.destroyed.get(), 0);
        outer.exit().unwrap();
        assert_eq!(machine.destroyed.get(), 1);
    }

    #[test]
    fn dropped_scope_exits() {
        let machine = Counted::new();
        {
            let _scope = machine.enter();
        }
        assert_eq!(machine.destroyed.get(), 1);
    }

    #[test]
    fn exit_without_enter_underflows() {
        let machine = Counted::new();
        let err = exit(&machine).unwrap_err();
        assert!(matches!(err, MachineError::ScopeUnderflow { .. }));
        assert_eq!(machine.refs().get(), 0);
        assert_eq!(machine.destroyed.get(), 0);
    }

    #[test]
    fn destroy_error_propagates_from_exit() {
        let mut machine = Counted::new();
        machine.fail = true;
        let scope = machine.enter();
        assert!(scope.exit().is_err());
        assert_eq!(machine.refs().get(), 0);
    }

    #[test]
    fn scope_works_through_trait_objects() {
        let machine: Box<dyn Machine> = Box::new(Counted::new());
        let scope = Scope::enter(&*machine);
        assert_eq!(scope.name(), "counted");
        scope.exit().unwrap();
        assert_eq!(machine.refs().get(), 0);
    }

    #[test]
    fn busy_channel_is_reported() {
        let cell = RefCell::new(Channel::new("lab", crate::test_utils::MockChannel::new()));
        let _held = borrow_channel(&cell, "lab").unwrap();
        let err = borrow_channel(&cell, "lab").unwrap_err();
        assert!(matches!(err, MachineError::ChannelBusy { .. }));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn n_enters_then_n_exits_destroy_once(n in 1usize..64) {
                let machine = Counted::new();
                let scopes: Vec<_> = (0..n).map(|_| machine.enter()).collect();
                prop_assert_eq!(machine.refs().get(), n);

                for (i, scope) in scopes.into_iter().rev().enumerate() {
                    prop_assert_eq!(machine.destroyed.get(), 0);
                    scope.exit().unwrap();
                    prop_assert_eq!(machine.refs().get(), n - i - 1);
                }
                prop_assert_eq!(machine.destroyed.get(), 1);
            }

            #[test]
            fn partial_exits_never_destroy(n in 2usize..64, k in 1usize..63) {
                let k = k.min(n - 1);
                let machine = Counted::new();
                let mut scopes: Vec<_> = (0..n).map(|_| machine.enter()).collect();
                for scope in scopes.drain(..k) {
                    scope.exit().unwrap();
                }
                prop_assert_eq!(machine.destroyed.get(), 0);
                prop_assert_eq!(machine.refs().get(), n - k);
                drop(scopes);
                prop_assert_eq!(machine.destroyed.get(), 1);
            }
        }
    }
}

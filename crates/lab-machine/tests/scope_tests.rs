//! Scope lifecycle through the public API.

use std::cell::Cell;

use lab_machine::machine::exit;
use lab_machine::{Machine, MachineError, RefCount, Result, Scope};
use proptest::prelude::*;

#[derive(Default)]
struct Board {
    refs: RefCount,
    destroyed: Cell<usize>,
}

impl Machine for Board {
    fn name(&self) -> &str {
        "board"
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn destroy(&self) -> Result<()> {
        assert_eq!(self.refs.get(), 0, "destroyed while still in use");
        self.destroyed.set(self.destroyed.get() + 1);
        Ok(())
    }
}

#[test]
fn nested_helpers_share_one_connection() {
    fn helper(board: &Board) -> Result<()> {
        let scope = board.enter();
        assert!(scope.refs().get() >= 1);
        scope.exit()
    }

    let board = Board::default();
    let scope = board.enter();
    helper(&board).unwrap();
    helper(&board).unwrap();
    assert_eq!(board.destroyed.get(), 0);
    scope.exit().unwrap();
    assert_eq!(board.destroyed.get(), 1);
}

#[test]
fn reentering_after_teardown_destroys_again() {
    let board = Board::default();
    board.enter().exit().unwrap();
    board.enter().exit().unwrap();
    assert_eq!(board.destroyed.get(), 2);
}

#[test]
fn unmatched_exit_is_a_contract_violation() {
    let board = Board::default();
    let err = exit(&board).unwrap_err();
    assert!(matches!(err, MachineError::ScopeUnderflow { ref machine } if machine == "board"));
    assert!(err.is_contract_violation());
    assert_eq!(board.refs().get(), 0);
}

#[test]
fn scope_derefs_to_machine() {
    let board = Board::default();
    let scope = Scope::enter(&board);
    assert_eq!(scope.name(), "board");
    assert!(std::ptr::eq(scope.machine(), &board));
}

proptest! {
    #[test]
    fn interleaved_scopes_destroy_once_per_descent(pattern in proptest::collection::vec(any::<bool>(), 1..100)) {
        let board = Board::default();
        let mut open = Vec::new();
        let mut descents = 0;

        for enter in pattern {
            if enter || open.is_empty() {
                open.push(board.enter());
            } else {
                let scope = open.pop().unwrap();
                scope.exit().unwrap();
                if open.is_empty() {
                    descents += 1;
                }
            }
            prop_assert_eq!(board.refs().get(), open.len());
            prop_assert_eq!(board.destroyed.get(), descents);
        }

        let tail = usize::from(!open.is_empty());
        while let Some(scope) = open.pop() {
            scope.exit().unwrap();
        }
        prop_assert_eq!(board.destroyed.get(), descents + tail);
    }
}

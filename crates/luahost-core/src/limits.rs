//! Resource policies: the instruction budget and the allocator ceiling.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mlua::{HookTriggers, Lua, Thread, VmState};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};

/// How often, in instructions, the budget hook runs unless configured.
pub const DEFAULT_HOOK_INTERVAL: u32 = 1000;

/// Memory policy of a state. Every guest allocation goes through the
/// interpreter's allocator; `Limited` makes it refuse growth past the ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocator {
    #[default]
    System,
    Limited { max_bytes: usize },
}

impl Allocator {
    pub fn limited(max_bytes: usize) -> Self {
        Allocator::Limited { max_bytes }
    }

    pub fn max_bytes(&self) -> Option<usize> {
        match self {
            Allocator::System => None,
            Allocator::Limited { max_bytes } => Some(*max_bytes),
        }
    }

    pub(crate) fn apply(&self, lua: &Lua) -> Result<()> {
        // 0 lifts the ceiling
        lua.set_memory_limit(self.max_bytes().unwrap_or(0))?;
        debug!(allocator = ?self, "allocator policy applied");
        Ok(())
    }
}

/// Instruction budget, re-armed at each top-level entry into the guest.
#[derive(Debug)]
pub(crate) struct ExecutionLimit {
    limit: Cell<u32>,
    interval: Cell<u32>,
}

impl Default for ExecutionLimit {
    fn default() -> Self {
        Self {
            limit: Cell::new(0),
            interval: Cell::new(DEFAULT_HOOK_INTERVAL),
        }
    }
}

impl ExecutionLimit {
    pub(crate) fn get(&self) -> Option<u32> {
        match self.limit.get() {
            0 => None,
            n => Some(n),
        }
    }

    /// `0` clears the limit and removes the hook immediately.
    pub(crate) fn set(&self, lua: &Lua, limit: u32) {
        self.limit.set(limit);
        if limit == 0 {
            disarm(lua);
        }
    }

    pub(crate) fn interval(&self) -> u32 {
        self.interval.get()
    }

    pub(crate) fn set_interval(&self, interval: u32) {
        self.interval.set(interval.max(1));
    }

    /// Installs a hook with a full budget, replacing any spent one.
    pub(crate) fn arm(&self, lua: &Lua) {
        let limit = self.limit.get();
        if limit == 0 {
            disarm(lua);
            return;
        }
        let budget = Rc::new(Budget {
            limit,
            step: self.interval.get().min(limit).max(1),
            spent: Cell::new(0),
        });
        ActiveBudget::replace(lua, Some(budget.clone()));
        hook(lua, None, budget);
    }
}

/// Drops the hook and the budget of the run in progress.
pub(crate) fn disarm(lua: &Lua) {
    ActiveBudget::replace(lua, None);
    lua.remove_hook();
}

/// Moves the budget hook onto `thread` before it runs, or back onto the
/// running thread when `None`. The interpreter keeps a single hooked thread,
/// so every switch is charged a full interval for the ticks it resets.
pub(crate) fn follow(lua: &Lua, thread: Option<&Thread>) {
    let Some(budget) = ActiveBudget::current(lua) else {
        return;
    };
    budget.spend(budget.step);
    hook(lua, thread, budget);
}

/// One top-level run's worth of instructions, shared by every thread the
/// run resumes.
#[derive(Debug)]
struct Budget {
    limit: u32,
    step: u32,
    spent: Cell<u64>,
}

impl Budget {
    fn spend(&self, n: u32) {
        self.spent.set(self.spent.get() + u64::from(n));
    }

    fn exhausted(&self) -> bool {
        self.spent.get() >= u64::from(self.limit)
    }
}

/// Slot in the runtime's app data. Only the first arm inserts it; later
/// runs swap the contents, so arming never needs the container mutably.
struct ActiveBudget(RefCell<Option<Rc<Budget>>>);

impl ActiveBudget {
    fn replace(lua: &Lua, budget: Option<Rc<Budget>>) {
        match lua.app_data_ref::<ActiveBudget>() {
            Some(slot) => *slot.0.borrow_mut() = budget,
            None if budget.is_some() => {
                lua.set_app_data(ActiveBudget(RefCell::new(budget)));
            }
            None => {}
        }
    }

    fn current(lua: &Lua) -> Option<Rc<Budget>> {
        lua.app_data_ref::<ActiveBudget>()
            .and_then(|slot| slot.0.borrow().clone())
    }
}

/// Once the budget is spent the hook fires on every instruction, so a frame
/// that caught the first `LimitExceeded` faults again before it gets anywhere.
fn hook(lua: &Lua, thread: Option<&Thread>, budget: Rc<Budget>) {
    let step = if budget.exhausted() { 1 } else { budget.step };
    let triggers = HookTriggers::new().every_nth_instruction(step);
    match thread {
        Some(thread) => thread.set_hook(triggers, tick(budget, step)),
        None => lua.set_hook(triggers, tick(budget, step)),
    }
}

fn tick(budget: Rc<Budget>, step: u32) -> impl Fn(&Lua, mlua::Debug<'_>) -> mlua::Result<VmState> {
    move |lua, _debug| {
        budget.spend(step);
        if !budget.exhausted() {
            return Ok(VmState::Continue);
        }
        if step > 1 {
            hook(lua, None, budget.clone());
        }
        Err(mlua::Error::external(BridgeError::LimitExceeded {
            limit: budget.limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panic::classify;

    #[test]
    fn zero_means_unlimited() {
        let lua = Lua::new();
        let limit = ExecutionLimit::default();
        assert_eq!(limit.get(), None);
        limit.set(&lua, 500);
        assert_eq!(limit.get(), Some(500));
        limit.set(&lua, 0);
        assert_eq!(limit.get(), None);
    }

    #[test]
    fn infinite_loops_are_stopped() {
        let lua = Lua::new();
        let limit = ExecutionLimit::default();
        limit.set(&lua, 10_000);
        limit.arm(&lua);
        let err = lua.load("while true do end").exec().expect_err("must stop");
        assert!(matches!(classify(err), BridgeError::LimitExceeded { limit: 10_000 }));
    }

    #[test]
    fn rearming_restores_the_full_budget() {
        let lua = Lua::new();
        let limit = ExecutionLimit::default();
        limit.set(&lua, 50_000);
        limit.set_interval(100);
        for _ in 0..3 {
            limit.arm(&lua);
            lua.load("for i = 1, 1000 do end").exec().expect("fits the budget");
        }
    }

    #[test]
    fn caught_limit_faults_do_not_reset_the_budget() {
        let lua = Lua::new();
        let limit = ExecutionLimit::default();
        limit.set(&lua, 10_000);
        limit.arm(&lua);
        let err = lua
            .load(
                r#"
                local n = 0
                while n < 200000 do
                    n = n + 1
                    pcall(function() while true do end end)
                end
                return n
                "#,
            )
            .eval::<i64>()
            .expect_err("the loop must not finish");
        assert!(matches!(classify(err), BridgeError::LimitExceeded { limit: 10_000 }));
    }

    #[test]
    fn disarming_lifts_a_spent_budget() {
        let lua = Lua::new();
        let limit = ExecutionLimit::default();
        limit.set(&lua, 100);
        limit.set_interval(10);
        limit.arm(&lua);
        assert!(lua.load("while true do end").exec().is_err());
        disarm(&lua);
        lua.load("for i = 1, 10000 do end").exec().expect("no hook left");
    }

    #[test]
    fn allocator_ceiling_rejects_large_strings() {
        let lua = Lua::new();
        Allocator::limited(4 * 1024 * 1024).apply(&lua).expect("apply");
        let err = lua
            .load("return string.rep('x', 64 * 1024 * 1024)")
            .exec()
            .expect_err("too big");
        assert!(matches!(classify(err), BridgeError::Allocation(_)));

        Allocator::System.apply(&lua).expect("lift");
        lua.load("return string.rep('x', 8 * 1024 * 1024)")
            .exec()
            .expect("fits without a ceiling");
    }
}

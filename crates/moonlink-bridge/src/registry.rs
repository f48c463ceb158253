//! Identity registry: which host slot owns an interpreter, and stable
//! positions for every thread (main or coroutine) seen under it.
//!
//! Three tables live in the interpreter's own registry, so they die with it:
//!
//! - `moonlink.main_slots`: main thread -> host slot
//! - `moonlink.uniq`: position -> thread (main at 1, coroutines appended)
//! - `moonlink.rev_uniq`: thread -> position
//!
//! Entries are only ever appended. A position, once handed out, stays valid
//! for the life of the main instance even after its coroutine is unreachable.

use std::ffi::CStr;
use std::num::NonZeroU32;

use derive_more::Display;

use crate::error::{BridgeError, BridgeResult};
use crate::state::{InterpreterHandle, LuaType, State};

const MAIN_SLOTS_KEY: &CStr = c"moonlink.main_slots";
const UNIQ_KEY: &CStr = c"moonlink.uniq";
const REV_UNIQ_KEY: &CStr = c"moonlink.rev_uniq";

/// Host-side identity of one main instance. `0` means "unknown" and is never
/// a valid slot, so it is modelled as `Option<HostSlot>::None`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct HostSlot(NonZeroU32);

impl HostSlot {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(HostSlot)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// 1-based position of a thread within its main instance's dedup table.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct Position(u32);

impl Position {
    pub const MAIN: Position = Position(1);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_main(self) -> bool {
        self == Position::MAIN
    }
}

/// Register `state` (which must be a main thread) under `slot`.
///
/// Idempotent: a second registration returns the first position and leaves the
/// first slot in place.
pub fn register_main(state: &State, slot: HostSlot) -> BridgeResult<Position> {
    if !is_main_thread(state) {
        return Err(BridgeError::not_main_thread());
    }
    ensure_tables(state);

    let position = match position_of_self(state) {
        Some(position) => position,
        None => append_self(state),
    };

    // main_slots[self] = slot, only if nothing is recorded yet
    state.registry_get(MAIN_SLOTS_KEY);
    state.push_thread();
    state.raw_get(-2);
    let recorded = state.type_of(-1) == LuaType::Number;
    state.pop(1);
    if !recorded {
        state.push_thread();
        state.push_integer(i64::from(slot.get()));
        state.raw_set(-3);
        tracing::debug!(%slot, %position, "registered main interpreter");
    }
    state.pop(1);

    Ok(position)
}

/// Stable position for the running thread, registering it on first sight.
///
/// A coroutine whose main instance was never registered is refused so that
/// position 1 can only go to a main thread.
pub fn dedup_coroutine(state: &State) -> BridgeResult<Position> {
    if !has_tables(state) {
        if !is_main_thread(state) {
            return Err(BridgeError::unregistered_instance());
        }
        ensure_tables(state);
    }
    if let Some(position) = position_of_self(state) {
        return Ok(position);
    }
    let position = append_self(state);
    tracing::trace!(%position, "registered coroutine");
    Ok(position)
}

/// Slot of the main instance owning `state` (works from coroutines).
pub fn lookup_slot(state: &State) -> Option<HostSlot> {
    state.registry_get(MAIN_SLOTS_KEY);
    if !state.is_table(-1) {
        state.pop(1);
        return None;
    }
    state.registry_get(UNIQ_KEY);
    if !state.is_table(-1) {
        state.pop(2);
        return None;
    }
    state.raw_get_i(-1, 1);
    if state.type_of(-1) != LuaType::Thread {
        state.pop(3);
        return None;
    }
    state.raw_get(-3);
    let slot = read_slot(state);
    state.pop(3);
    slot
}

/// Slot recorded for the running thread itself; `None` for coroutines.
pub fn direct_slot(state: &State) -> Option<HostSlot> {
    state.registry_get(MAIN_SLOTS_KEY);
    if !state.is_table(-1) {
        state.pop(1);
        return None;
    }
    state.push_thread();
    state.raw_get(-2);
    let slot = read_slot(state);
    state.pop(2);
    slot
}

/// Main thread of the instance `state` belongs to, as recorded at position 1.
pub fn main_thread(state: &State) -> Option<InterpreterHandle> {
    handle_at(state, Position::MAIN)
}

/// Thread registered at `position`, if any.
pub fn handle_at(state: &State, position: Position) -> Option<InterpreterHandle> {
    let index = i32::try_from(position.get()).ok()?;
    state.registry_get(UNIQ_KEY);
    if !state.is_table(-1) {
        state.pop(1);
        return None;
    }
    state.raw_get_i(-1, index);
    let handle = state.to_thread(-1);
    state.pop(2);
    handle
}

/// Number of positions handed out so far.
pub fn known_positions(state: &State) -> u32 {
    state.registry_get(UNIQ_KEY);
    let len = if state.is_table(-1) { state.objlen(-1) } else { 0 };
    state.pop(1);
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn is_main_thread(state: &State) -> bool {
    let main = state.push_thread();
    state.pop(1);
    main
}

fn has_tables(state: &State) -> bool {
    state.registry_get(REV_UNIQ_KEY);
    let present = state.is_table(-1);
    state.pop(1);
    present
}

fn ensure_tables(state: &State) {
    for key in [MAIN_SLOTS_KEY, UNIQ_KEY, REV_UNIQ_KEY] {
        state.registry_get(key);
        let present = state.is_table(-1);
        state.pop(1);
        if !present {
            state.new_table();
            state.registry_set(key);
        }
    }
}

fn position_of_self(state: &State) -> Option<Position> {
    state.registry_get(REV_UNIQ_KEY);
    state.push_thread();
    state.raw_get(-2);
    let position = state
        .to_integer(-1)
        .and_then(|p| u32::try_from(p).ok())
        .filter(|&p| p > 0)
        .map(Position);
    state.pop(2);
    position
}

/// Append the running thread to `uniq` and record its reverse entry.
fn append_self(state: &State) -> Position {
    state.registry_get(UNIQ_KEY);
    state.registry_get(REV_UNIQ_KEY);
    let next = state.objlen(-2) + 1;
    let index = i32::try_from(next).unwrap_or(i32::MAX);

    // uniq[next] = self
    state.push_thread();
    state.raw_set_i(-3, index);

    // rev_uniq[self] = next
    state.push_thread();
    state.push_integer(i64::from(index));
    state.raw_set(-3);

    state.pop(2);
    Position(index as u32)
}

fn read_slot(state: &State) -> Option<HostSlot> {
    state
        .to_integer(-1)
        .and_then(|raw| u32::try_from(raw).ok())
        .and_then(HostSlot::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_slot_rejects_zero() {
        assert!(HostSlot::new(0).is_none());
        assert_eq!(HostSlot::new(7).map(HostSlot::get), Some(7));
    }

    #[test]
    fn test_position_main_is_one() {
        assert_eq!(Position::MAIN.get(), 1);
        assert!(Position::MAIN.is_main());
    }
}

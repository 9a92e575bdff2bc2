//! Generation lifecycle: Installing → Waiting → Active → Superseded.
//!
//! The controller only tracks state. Seeding and partition cleanup happen in
//! the engine, which calls into the controller at each transition.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

#[derive(Debug, Default)]
struct Inner {
  states: BTreeMap<u32, LifecycleState>,
  active: Option<u32>,
  /// Host asked to adopt the waiting generation immediately
  adopt_requested: bool,
}

#[derive(Debug, Default)]
pub struct LifecycleController {
  inner: Mutex<Inner>,
}

impl LifecycleController {
  pub fn new() -> Self {
    Self::default()
  }

  /// Controller resuming with `generation` already active.
  pub fn resume(generation: u32) -> Self {
    let controller = Self::new();
    {
      let mut inner = controller.lock();
      inner.states.insert(generation, LifecycleState::Active);
      inner.active = Some(generation);
    }
    controller
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // Every transition is a single assignment, so a poisoned lock holds a
    // consistent state
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn active(&self) -> Option<u32> {
    self.lock().active
  }

  pub fn state(&self, generation: u32) -> Option<LifecycleState> {
    self.lock().states.get(&generation).copied()
  }

  /// The installed generation waiting to be activated, if any.
  pub fn waiting(&self) -> Option<u32> {
    self
      .lock()
      .states
      .iter()
      .rev()
      .find(|(_, s)| **s == LifecycleState::Waiting)
      .map(|(g, _)| *g)
  }

  /// Enter `Installing` for a generation newer than the active one.
  pub fn begin_install(&self, generation: u32) -> Result<(), InstallError> {
    let mut inner = self.lock();
    if let Some(active) = inner.active {
      if generation <= active {
        return Err(InstallError::Stale {
          requested: generation,
          active,
        });
      }
    }
    if inner.states.get(&generation) == Some(&LifecycleState::Installing) {
      return Err(InstallError::InProgress(generation));
    }
    inner.states.insert(generation, LifecycleState::Installing);
    info!(generation, "installing generation");
    Ok(())
  }

  /// Seeding finished: move to `Waiting`.
  pub fn finish_install(&self, generation: u32) {
    let mut inner = self.lock();
    if inner.states.get(&generation) == Some(&LifecycleState::Installing) {
      inner.states.insert(generation, LifecycleState::Waiting);
      info!(generation, "generation installed, waiting to activate");
    }
  }

  /// Seeding failed: forget the generation; the active one stays in charge.
  pub fn abort_install(&self, generation: u32) {
    let mut inner = self.lock();
    if inner.states.get(&generation) == Some(&LifecycleState::Installing) {
      inner.states.remove(&generation);
    }
  }

  /// Handle an `ADOPT_NOW` request. Returns the waiting generation, if one
  /// can be activated right away. While a generation is still installing the
  /// request is remembered for it; with nothing installing or waiting it is
  /// dropped.
  pub fn request_adoption(&self) -> Option<u32> {
    if let Some(generation) = self.waiting() {
      return Some(generation);
    }
    let mut inner = self.lock();
    if inner.states.values().any(|s| *s == LifecycleState::Installing) {
      inner.adopt_requested = true;
    }
    None
  }

  /// Whether a waiting generation may activate now: nothing is active yet,
  /// previous instances are gone, or adoption was requested.
  pub fn may_activate(&self, previous_released: bool) -> bool {
    let inner = self.lock();
    inner.active.is_none() || previous_released || inner.adopt_requested
  }

  /// Run `write` only while `generation` is the active one, or while nothing
  /// is active yet. The lock is held across `write`, so an activation cannot
  /// reclaim the partition between the check and the write.
  pub fn while_current<R>(&self, generation: u32, write: impl FnOnce() -> R) -> Option<R> {
    let inner = self.lock();
    match inner.active {
      Some(active) if active != generation => None,
      _ => Some(write()),
    }
  }

  /// Make a `Waiting` generation active. The previous active generation
  /// becomes `Superseded` and is returned.
  ///
  /// Returns `None` without changing anything unless `generation` finished
  /// installing, which is the barrier between install and activate.
  pub fn activate(&self, generation: u32) -> Option<Option<u32>> {
    let mut inner = self.lock();
    if inner.states.get(&generation) != Some(&LifecycleState::Waiting) {
      return None;
    }

    let previous = inner.active.replace(generation);
    if let Some(prev) = previous {
      inner.states.insert(prev, LifecycleState::Superseded);
    }
    // Older generations still waiting can never activate now
    inner
      .states
      .retain(|g, s| *g >= generation || *s != LifecycleState::Waiting);
    inner.states.insert(generation, LifecycleState::Active);
    inner.adopt_requested = false;
    info!(generation, ?previous, "generation active");
    Some(previous)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_transition_sequence() {
    let lc = LifecycleController::new();
    lc.begin_install(1).unwrap();
    assert_eq!(lc.state(1), Some(LifecycleState::Installing));

    lc.finish_install(1);
    assert_eq!(lc.state(1), Some(LifecycleState::Waiting));
    assert!(lc.may_activate(false), "first generation activates immediately");
    assert_eq!(lc.activate(1), Some(None));

    lc.begin_install(2).unwrap();
    lc.finish_install(2);
    assert!(!lc.may_activate(false));
    assert_eq!(lc.activate(2), Some(Some(1)));
    assert_eq!(lc.state(1), Some(LifecycleState::Superseded));
    assert_eq!(lc.state(2), Some(LifecycleState::Active));
    assert_eq!(lc.active(), Some(2));
  }

  #[test]
  fn test_activation_requires_completed_install() {
    let lc = LifecycleController::resume(1);
    lc.begin_install(2).unwrap();
    assert_eq!(lc.activate(2), None);
    assert_eq!(lc.active(), Some(1));
    assert_eq!(lc.activate(7), None);
  }

  #[test]
  fn test_abort_keeps_previous_generation() {
    let lc = LifecycleController::resume(3);
    lc.begin_install(4).unwrap();
    lc.abort_install(4);
    assert_eq!(lc.state(4), None);
    assert_eq!(lc.active(), Some(3));
    assert_eq!(lc.waiting(), None);
  }

  #[test]
  fn test_stale_and_duplicate_installs_rejected() {
    let lc = LifecycleController::resume(3);
    assert!(matches!(lc.begin_install(3), Err(InstallError::Stale { .. })));
    assert!(matches!(lc.begin_install(2), Err(InstallError::Stale { .. })));

    lc.begin_install(4).unwrap();
    assert!(matches!(lc.begin_install(4), Err(InstallError::InProgress(4))));
  }

  #[test]
  fn test_adopt_now() {
    let lc = LifecycleController::resume(1);
    lc.begin_install(2).unwrap();
    lc.finish_install(2);
    assert!(!lc.may_activate(false));
    assert_eq!(lc.request_adoption(), Some(2));
    lc.activate(2);

    // The request is consumed by the activation
    lc.begin_install(3).unwrap();
    lc.finish_install(3);
    assert!(!lc.may_activate(false));
    assert!(lc.may_activate(true));
  }

  #[test]
  fn test_adopt_now_with_nothing_pending_is_dropped() {
    let lc = LifecycleController::resume(1);
    assert_eq!(lc.request_adoption(), None);

    lc.begin_install(2).unwrap();
    lc.finish_install(2);
    assert!(!lc.may_activate(false));
    assert_eq!(lc.waiting(), Some(2));
  }

  #[test]
  fn test_adopt_now_during_install_applies_to_that_generation() {
    let lc = LifecycleController::resume(1);
    lc.begin_install(2).unwrap();
    assert_eq!(lc.request_adoption(), None);

    lc.finish_install(2);
    assert!(lc.may_activate(false));
  }

  #[test]
  fn test_while_current_blocks_writes_for_other_generations() {
    let lc = LifecycleController::new();
    assert_eq!(lc.while_current(1, || "written"), Some("written"));

    lc.begin_install(1).unwrap();
    lc.finish_install(1);
    lc.activate(1);
    lc.begin_install(2).unwrap();
    lc.finish_install(2);
    lc.activate(2);

    assert_eq!(lc.while_current(1, || "written"), None);
    assert_eq!(lc.while_current(2, || "written"), Some("written"));
  }
}

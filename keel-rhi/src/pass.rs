//! Pass orchestration: which single render pass is recording at any moment.
//!
//! The orchestrator is pure bookkeeping. It answers "what has to be closed and what has to
//! be opened" and the device replays the answer against the backend, so the command stream
//! never has two target-binding scopes open.

/// Kind of pass, without per-pass parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Main,
    Shadow,
    Geometry,
    AmbientOcclusion,
    Ui,
}

/// A pass that is currently open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivePass {
    Main,
    Shadow { cascade: u32 },
    Geometry,
    AmbientOcclusion,
    Ui,
}

impl ActivePass {
    #[inline]
    pub fn kind(self) -> PassKind {
        match self {
            ActivePass::Main => PassKind::Main,
            ActivePass::Shadow { .. } => PassKind::Shadow,
            ActivePass::Geometry => PassKind::Geometry,
            ActivePass::AmbientOcclusion => PassKind::AmbientOcclusion,
            ActivePass::Ui => PassKind::Ui,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PassState {
    #[default]
    Idle,
    Active(ActivePass),
}

impl PassState {
    #[inline]
    pub fn active(self) -> Option<ActivePass> {
        match self {
            PassState::Idle => None,
            PassState::Active(pass) => Some(pass),
        }
    }

    #[inline]
    pub fn is_active(self, kind: PassKind) -> bool {
        self.active().is_some_and(|pass| pass.kind() == kind)
    }
}

/// Scope changes the command stream must go through, in order: close, then open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassTransition {
    pub closed: Option<ActivePass>,
    pub opened: Option<ActivePass>,
}

impl PassTransition {
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.closed.is_none() && self.opened.is_none()
    }
}

#[derive(Debug, Default)]
pub struct PassOrchestrator {
    state: PassState,
}

impl PassOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> PassState {
        self.state
    }

    #[inline]
    pub fn active(&self) -> Option<ActivePass> {
        self.state.active()
    }

    /// Open `pass`, closing whichever other pass is open first. Re-opening the pass that is
    /// already active changes nothing.
    pub fn begin(&mut self, pass: ActivePass) -> PassTransition {
        match self.state {
            PassState::Active(current) if current == pass => PassTransition::default(),
            PassState::Active(current) => {
                self.state = PassState::Active(pass);
                PassTransition {
                    closed: Some(current),
                    opened: Some(pass),
                }
            }
            PassState::Idle => {
                self.state = PassState::Active(pass);
                PassTransition {
                    closed: None,
                    opened: Some(pass),
                }
            }
        }
    }

    /// Close the active pass if it is of `kind`; otherwise nothing happens.
    pub fn end(&mut self, kind: PassKind) -> PassTransition {
        match self.state {
            PassState::Active(current) if current.kind() == kind => {
                self.state = PassState::Idle;
                PassTransition {
                    closed: Some(current),
                    opened: None,
                }
            }
            _ => PassTransition::default(),
        }
    }

    /// Close whatever is open.
    pub fn end_any(&mut self) -> PassTransition {
        match self.state.active() {
            Some(pass) => self.end(pass.kind()),
            None => PassTransition::default(),
        }
    }

    /// Make sure some pass is open, defaulting to the main pass.
    pub fn ensure_open(&mut self) -> PassTransition {
        match self.state {
            PassState::Idle => self.begin(ActivePass::Main),
            PassState::Active(_) => PassTransition::default(),
        }
    }

    /// Forget the open pass without producing a transition (the command stream it was
    /// recorded into has been discarded).
    pub(crate) fn reset(&mut self) {
        self.state = PassState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn begin_from_idle_opens() {
        let mut passes = PassOrchestrator::new();
        let t = passes.begin(ActivePass::Geometry);
        assert_eq!(t, PassTransition { closed: None, opened: Some(ActivePass::Geometry) });
        assert_eq!(passes.active(), Some(ActivePass::Geometry));
    }

    #[test]
    fn begin_other_closes_current_first() {
        let mut passes = PassOrchestrator::new();
        passes.begin(ActivePass::Main);
        let t = passes.begin(ActivePass::Shadow { cascade: 2 });
        assert_eq!(t.closed, Some(ActivePass::Main));
        assert_eq!(t.opened, Some(ActivePass::Shadow { cascade: 2 }));
    }

    #[test]
    fn switching_cascades_reopens_shadow_pass() {
        let mut passes = PassOrchestrator::new();
        passes.begin(ActivePass::Shadow { cascade: 0 });
        let t = passes.begin(ActivePass::Shadow { cascade: 1 });
        assert_eq!(t.closed, Some(ActivePass::Shadow { cascade: 0 }));
        assert_eq!(t.opened, Some(ActivePass::Shadow { cascade: 1 }));
        assert!(passes.begin(ActivePass::Shadow { cascade: 1 }).is_noop());
    }

    #[test]
    fn end_of_inactive_pass_is_noop() {
        let mut passes = PassOrchestrator::new();
        assert!(passes.end(PassKind::Main).is_noop());
        passes.begin(ActivePass::Ui);
        assert!(passes.end(PassKind::Geometry).is_noop());
        assert_eq!(passes.active(), Some(ActivePass::Ui));
        assert_eq!(passes.end(PassKind::Ui).closed, Some(ActivePass::Ui));
        assert!(passes.end(PassKind::Ui).is_noop());
    }

    #[test]
    fn ensure_open_defaults_to_main() {
        let mut passes = PassOrchestrator::new();
        assert_eq!(passes.ensure_open().opened, Some(ActivePass::Main));
        passes.begin(ActivePass::AmbientOcclusion);
        assert!(passes.ensure_open().is_noop());
        assert_eq!(passes.active(), Some(ActivePass::AmbientOcclusion));
    }

    fn random_pass(rng: &mut StdRng) -> ActivePass {
        match rng.gen_range(0..5) {
            0 => ActivePass::Main,
            1 => ActivePass::Shadow { cascade: rng.gen_range(0..4) },
            2 => ActivePass::Geometry,
            3 => ActivePass::AmbientOcclusion,
            _ => ActivePass::Ui,
        }
    }

    #[test]
    fn random_sequences_keep_single_open_scope() {
        let mut rng = StdRng::seed_from_u64(0x5eed_0001);

        for _ in 0..200 {
            let mut passes = PassOrchestrator::new();
            // Mirror of the scopes a command stream would have open.
            let mut open_scopes: Vec<ActivePass> = Vec::new();
            let mut last_opened: Option<ActivePass> = None;

            for _ in 0..64 {
                let before = passes.state();
                let transition = match rng.gen_range(0..3) {
                    0 => passes.begin(random_pass(&mut rng)),
                    1 => passes.end(random_pass(&mut rng).kind()),
                    _ => passes.ensure_open(),
                };

                if let Some(closed) = transition.closed {
                    assert_eq!(open_scopes.pop(), Some(closed));
                    if last_opened == Some(closed) {
                        last_opened = None;
                    }
                }
                if let Some(opened) = transition.opened {
                    open_scopes.push(opened);
                    last_opened = Some(opened);
                }
                if transition.is_noop() {
                    assert_eq!(before, passes.state());
                }

                assert!(open_scopes.len() <= 1);
                assert_eq!(passes.active(), last_opened);
                assert_eq!(passes.active(), open_scopes.last().copied());
            }
        }
    }
}

/// Ring state for a pending incoming call.
///
/// The core only tracks whether ringing is in progress; audible playout
/// belongs to the platform layer, which watches the call phase. Owned
/// by the call machinery; `start` and `stop` are idempotent.
#[derive(Debug, Default)]
pub(super) struct Ringer {
    ringing: bool,
}

impl Ringer {
    pub(super) fn start(&mut self) {
        self.ringing = true;
    }

    pub(super) fn stop(&mut self) {
        self.ringing = false;
    }

    pub(super) fn is_ringing(&self) -> bool {
        self.ringing
    }
}

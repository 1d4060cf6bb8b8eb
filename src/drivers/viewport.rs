use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::types::ScrollTarget;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewMode {
    /// Bounds track the newest sample.
    Following,
    /// Bounds are the user's until the hold runs out.
    Held,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportState {
    pub mode: ViewMode,
    /// Set only while `Held`.
    pub held_until: Option<Instant>,
    pub lower: f64,
    pub upper: f64,
}

impl ViewportState {
    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }
}

/// Follow/hold state machine for the live view's visible window.
///
/// The x axis is the sample sequence number. While following, the window keeps
/// `1 - lead_fraction` of its width behind the newest sample and `lead_fraction` ahead of it.
/// A scroll holds the user's window for `hold_duration`; every further scroll restarts the hold.
pub struct ViewportController {
    state: ViewportState,
    width: f64,
    lead_fraction: f64,
    hold_duration: Duration,
    latest_sequence: u64,
}

pub type SharedViewport = Arc<Mutex<ViewportController>>;

impl ViewportController {
    pub fn new(width: f64, lead_fraction: f64, hold_duration: Duration) -> Self {
        let width = width.max(1.0);
        let lead_fraction = lead_fraction.clamp(0.0, 0.99);
        let mut controller = Self {
            state: ViewportState {
                mode: ViewMode::Following,
                held_until: None,
                lower: 0.0,
                upper: width,
            },
            width,
            lead_fraction,
            hold_duration,
            latest_sequence: 0,
        };
        controller.follow_latest();
        controller
    }

    pub fn shared(width: f64, lead_fraction: f64, hold_duration: Duration) -> SharedViewport {
        Arc::new(Mutex::new(Self::new(width, lead_fraction, hold_duration)))
    }

    pub fn state(&self) -> ViewportState {
        self.state
    }

    pub fn mode(&self) -> ViewMode {
        self.state.mode
    }

    /// A new sample arrived. Expires a lapsed hold first, then re-follows if following.
    pub fn tick(&mut self, latest_sequence: u64, now: Instant) -> ViewportState {
        self.latest_sequence = latest_sequence;
        self.hold_expired(now);
        if self.state.mode == ViewMode::Following {
            self.follow_latest();
        }
        self.state
    }

    pub fn user_scroll(&mut self, target: ScrollTarget, now: Instant) -> ViewportState {
        let lower = match target {
            ScrollTarget::Fraction(f) => f.clamp(0.0, 1.0) * self.latest_sequence as f64,
            ScrollTarget::Absolute(x) => x,
        };
        self.state = ViewportState {
            mode: ViewMode::Held,
            held_until: Some(now + self.hold_duration),
            lower,
            upper: lower + self.width,
        };
        debug!("viewport held at [{:.1}, {:.1}]", self.state.lower, self.state.upper);
        self.state
    }

    /// Returns to `Following` once the hold deadline has passed. Returns whether it did.
    pub fn hold_expired(&mut self, now: Instant) -> bool {
        match (self.state.mode, self.state.held_until) {
            (ViewMode::Held, Some(until)) if now >= until => {
                self.release();
                true
            }
            _ => false,
        }
    }

    /// Drops any hold immediately.
    pub fn release(&mut self) {
        self.state.mode = ViewMode::Following;
        self.state.held_until = None;
        self.follow_latest();
        debug!("viewport following sample {}", self.latest_sequence);
    }

    fn follow_latest(&mut self) {
        let trailing = self.width * (1.0 - self.lead_fraction);
        // Until there is enough history to trail, pin the window to the start.
        let lower = (self.latest_sequence as f64 - trailing).max(0.0);
        self.state.lower = lower;
        self.state.upper = lower + self.width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ViewportController {
        ViewportController::new(100.0, 0.2, Duration::from_secs(5))
    }

    #[test]
    fn following_keeps_latest_at_eighty_percent() {
        let mut view = controller();
        let now = Instant::now();
        let state = view.tick(500, now);
        assert_eq!(state.mode, ViewMode::Following);
        assert_eq!(state.lower, 420.0);
        assert_eq!(state.upper, 520.0);
    }

    #[test]
    fn short_history_is_pinned_to_start() {
        let mut view = controller();
        let state = view.tick(10, Instant::now());
        assert_eq!((state.lower, state.upper), (0.0, 100.0));
    }

    #[test]
    fn scroll_holds_and_ticks_do_not_move_bounds() {
        let mut view = controller();
        let now = Instant::now();
        view.tick(1000, now);
        let held = view.user_scroll(ScrollTarget::Fraction(0.5), now);
        assert_eq!(held.mode, ViewMode::Held);
        assert_eq!((held.lower, held.upper), (500.0, 600.0));
        let later = view.tick(1001, now + Duration::from_secs(1));
        assert_eq!(later, held);
    }

    #[test]
    fn scroll_while_held_restarts_hold() {
        let mut view = controller();
        let t0 = Instant::now();
        view.user_scroll(ScrollTarget::Absolute(10.0), t0);
        let t1 = t0 + Duration::from_secs(4);
        view.user_scroll(ScrollTarget::Absolute(20.0), t1);
        assert!(!view.hold_expired(t0 + Duration::from_secs(6)));
        assert_eq!(view.mode(), ViewMode::Held);
        assert!(view.hold_expired(t1 + Duration::from_secs(5)));
        assert_eq!(view.mode(), ViewMode::Following);
    }

    #[test]
    fn hold_lapses_on_first_tick_after_deadline() {
        let mut view = controller();
        let t0 = Instant::now();
        view.tick(300, t0);
        view.user_scroll(ScrollTarget::Absolute(0.0), t0);
        let before = view.tick(301, t0 + Duration::from_millis(4999));
        assert_eq!(before.mode, ViewMode::Held);
        let after = view.tick(302, t0 + Duration::from_secs(5));
        assert_eq!(after.mode, ViewMode::Following);
        assert_eq!(after.held_until, None);
        assert_eq!((after.lower, after.upper), (222.0, 322.0));
    }

    #[test]
    fn scroll_wins_while_following() {
        let mut view = controller();
        let now = Instant::now();
        view.tick(50, now);
        let state = view.user_scroll(ScrollTarget::Fraction(2.0), now);
        assert_eq!(state.mode, ViewMode::Held);
        assert_eq!(state.lower, 50.0);
    }
}

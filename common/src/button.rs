use std::fmt;

use crate::{clock::elapsed_ms, config::GestureConfig};

/// What a completed hold means, decided once at the release edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    None,
    ToggleServiceMode,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureAction {
    Pressed,
    Indicator(bool),
    HeldSeconds(u64),
    Released { held_ms: u64, gesture: Gesture },
}

impl fmt::Display for GestureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pressed => write!(f, "Button pressed. Timer started."),
            Self::Indicator(on) => write!(f, "indicator {}", if *on { "on" } else { "off" }),
            Self::HeldSeconds(seconds) => write!(f, "Button held for {seconds} seconds"),
            Self::Released {
                gesture: Gesture::None,
                ..
            } => write!(f, "Button released. Timer reset."),
            Self::Released {
                held_ms,
                gesture: Gesture::ToggleServiceMode,
            } => write!(f, "Button released after {held_ms} ms. Toggling service mode."),
            Self::Released {
                held_ms,
                gesture: Gesture::FactoryReset,
            } => write!(
                f,
                "Button released after {held_ms} ms. Clearing WiFi credentials and restarting."
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonState {
    pub is_pressed: bool,
    pub press_started_ms: u64,
    pub last_reported_second: u64,
    pub elapsed_at_release: Option<u64>,
}

/// Edge-tracking state machine for the service button.
///
/// Sampled once per scheduler tick, so hold durations are only as precise as the tick
/// period: a threshold is observed on the first tick at or after it, never in between.
/// There is no debounce beyond that sampling.
#[derive(Debug, Clone)]
pub struct GestureDetector {
    config: GestureConfig,
    state: ButtonState,
}

impl GestureDetector {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            state: ButtonState::default(),
        }
    }

    pub fn state(&self) -> &ButtonState {
        &self.state
    }

    pub fn is_held(&self) -> bool {
        self.state.is_pressed
    }

    /// Duration of the last completed hold, cleared on the next press edge.
    pub fn elapsed_at_release(&self) -> Option<u64> {
        self.state.elapsed_at_release
    }

    pub fn tick(&mut self, pressed: bool, now_ms: u64) -> Vec<GestureAction> {
        let mut actions = Vec::new();

        match (self.state.is_pressed, pressed) {
            (false, true) => {
                self.state = ButtonState {
                    is_pressed: true,
                    press_started_ms: now_ms,
                    last_reported_second: 0,
                    elapsed_at_release: None,
                };
                actions.push(GestureAction::Pressed);
                actions.push(GestureAction::Indicator(true));
            }
            (true, true) => self.while_held(now_ms, &mut actions),
            (true, false) => self.on_release(now_ms, &mut actions),
            (false, false) => {}
        }

        actions
    }

    /// Indicator is lit for the whole hold except the one-second window that marks the
    /// service-mode band.
    pub fn indicator_for(&self, held_ms: u64) -> bool {
        !(self.config.service_toggle_min_ms..self.config.service_toggle_max_ms)
            .contains(&held_ms)
    }

    pub fn classify(&self, held_ms: u64) -> Gesture {
        if held_ms >= self.config.factory_reset_ms {
            Gesture::FactoryReset
        } else if (self.config.service_toggle_min_ms..self.config.service_toggle_max_ms)
            .contains(&held_ms)
        {
            Gesture::ToggleServiceMode
        } else {
            Gesture::None
        }
    }

    fn while_held(&mut self, now_ms: u64, actions: &mut Vec<GestureAction>) {
        let held_ms = elapsed_ms(now_ms, self.state.press_started_ms);

        let second = held_ms / 1_000;
        if second > self.state.last_reported_second {
            self.state.last_reported_second = second;
            actions.push(GestureAction::HeldSeconds(second));
        }

        actions.push(GestureAction::Indicator(self.indicator_for(held_ms)));
    }

    fn on_release(&mut self, now_ms: u64, actions: &mut Vec<GestureAction>) {
        let held_ms = elapsed_ms(now_ms, self.state.press_started_ms);

        self.state.is_pressed = false;
        self.state.last_reported_second = 0;
        self.state.elapsed_at_release = Some(held_ms);

        actions.push(GestureAction::Indicator(false));
        actions.push(GestureAction::Released {
            held_ms,
            gesture: self.classify(held_ms),
        });
    }
}

impl Default for GestureDetector {
    fn default() -> Self {
        Self::new(GestureConfig::default())
    }
}

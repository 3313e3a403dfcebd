use std::sync::Arc;

use crate::{
    button::{Gesture, GestureAction, GestureDetector},
    clock::{elapsed_ms, WallClock},
    config::NodeConfig,
    datalog::DataLog,
    mode::ServiceMode,
    reporter::{Broadcaster, ReportOutcome, Reporter, TemperatureSensor},
    storage::Storage,
};

/// Digital I/O the control loop drives directly.
pub trait Board {
    /// Logical level: true while the button is held, whatever the pin polarity.
    fn button_pressed(&mut self) -> bool;
    fn set_indicator(&mut self, on: bool);
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Button is down; nothing else ran.
    Held,
    /// A reset hold was released. Service mode is already cleared; the runtime must
    /// wipe credentials and restart.
    FactoryReset,
    /// Button handled; the sensor is not due for another poll yet.
    Idle,
    Ran(ReportOutcome),
}

/// Result of one tick plus the gesture events seen on the way, for logging.
#[derive(Debug)]
pub struct Tick {
    pub gestures: Vec<GestureAction>,
    pub service_mode_changed: Option<bool>,
    pub outcome: TickOutcome,
}

/// One cooperative control loop: gesture handling every tick, then the sensor once per
/// sample period.
pub struct Scheduler<D, T, B, W, S> {
    board: D,
    sensor: T,
    broadcaster: B,
    clock: W,
    log: Arc<DataLog<S>>,
    mode: ServiceMode,
    gestures: GestureDetector,
    reporter: Reporter,
    sample_period_ms: u64,
    last_sample_ms: Option<u64>,
}

impl<D, T, B, W, S> Scheduler<D, T, B, W, S>
where
    D: Board,
    T: TemperatureSensor,
    B: Broadcaster,
    W: WallClock,
    S: Storage,
{
    pub fn new(
        config: &NodeConfig,
        board: D,
        sensor: T,
        broadcaster: B,
        clock: W,
        log: Arc<DataLog<S>>,
        mode: ServiceMode,
    ) -> Self {
        Self {
            board,
            sensor,
            broadcaster,
            clock,
            log,
            mode,
            gestures: GestureDetector::new(config.gesture),
            reporter: Reporter::new(config.report_interval_ms),
            sample_period_ms: config.sample_period_ms,
            last_sample_ms: None,
        }
    }

    pub fn mode(&self) -> &ServiceMode {
        &self.mode
    }

    pub fn gestures(&self) -> &GestureDetector {
        &self.gestures
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn board(&self) -> &D {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut D {
        &mut self.board
    }

    pub fn tick(&mut self, now_ms: u64) -> Tick {
        let pressed = self.board.button_pressed();
        let gestures = self.gestures.tick(pressed, now_ms);

        let mut release = None;
        for action in &gestures {
            match *action {
                GestureAction::Indicator(on) => self.board.set_indicator(on),
                GestureAction::Released { gesture, .. } => release = Some(gesture),
                GestureAction::Pressed | GestureAction::HeldSeconds(_) => {}
            }
        }

        if self.gestures.is_held() {
            return Tick {
                gestures,
                service_mode_changed: None,
                outcome: TickOutcome::Held,
            };
        }

        let mut service_mode_changed = None;
        match release {
            Some(Gesture::ToggleServiceMode) => {
                service_mode_changed = Some(self.mode.toggle());
            }
            Some(Gesture::FactoryReset) => {
                self.mode.set(false);
                return Tick {
                    gestures,
                    service_mode_changed: None,
                    outcome: TickOutcome::FactoryReset,
                };
            }
            Some(Gesture::None) | None => {}
        }

        let sample_due = self
            .last_sample_ms
            .map_or(true, |last| elapsed_ms(now_ms, last) >= self.sample_period_ms);
        if !sample_due {
            return Tick {
                gestures,
                service_mode_changed,
                outcome: TickOutcome::Idle,
            };
        }
        self.last_sample_ms = Some(now_ms);

        let report = self.reporter.tick(
            now_ms,
            &self.mode,
            &mut self.sensor,
            &self.broadcaster,
            &self.clock,
            &self.log,
        );

        Tick {
            gestures,
            service_mode_changed,
            outcome: TickOutcome::Ran(report),
        }
    }
}

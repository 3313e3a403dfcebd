use std::fmt;

use crate::{
    clock::{elapsed_ms, WallClock},
    datalog::{format_log_line, format_reading, DataLog},
    mode::ServiceMode,
    storage::{Storage, StorageError},
};

/// Value the DS18B20 driver reports when no device answers.
pub const DISCONNECTED_CELSIUS: f32 = -127.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemperatureReading {
    Celsius(f32),
    Disconnected,
}

impl TemperatureReading {
    /// Maps a raw driver value, treating the disconnect sentinel and non-finite values
    /// as no reading.
    pub fn from_raw(celsius: f32) -> Self {
        if !celsius.is_finite() || celsius <= DISCONNECTED_CELSIUS {
            Self::Disconnected
        } else {
            Self::Celsius(celsius)
        }
    }
}

/// Single temperature probe. `request_reading` starts a conversion, `read_celsius`
/// collects it.
pub trait TemperatureSensor {
    fn request_reading(&mut self);
    fn read_celsius(&mut self) -> TemperatureReading;
}

/// Fan-out to every connected real-time client.
pub trait Broadcaster {
    fn broadcast(&self, text: &str);
}

#[derive(Debug)]
pub enum ReportOutcome {
    Paused,
    SensorDisconnected,
    NotDue { celsius: f32 },
    Reported {
        celsius: f32,
        line: String,
        append: Result<(), StorageError>,
        regenerate: Result<usize, StorageError>,
    },
}

impl fmt::Display for ReportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "service mode active; reporting paused"),
            Self::SensorDisconnected => write!(f, "Sensor not found or disconnected."),
            Self::NotDue { celsius } => write!(f, "Temperature: {celsius:.2} °C"),
            Self::Reported { line, .. } => write!(f, "logged {}", line.trim_end()),
        }
    }
}

/// Interval-gated sampling, broadcast and logging.
#[derive(Debug, Clone)]
pub struct Reporter {
    interval_ms: u64,
    last_report_ms: u64,
}

impl Reporter {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_report_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_report_ms(&self) -> u64 {
        self.last_report_ms
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        elapsed_ms(now_ms, self.last_report_ms) >= self.interval_ms
    }

    /// Storage failures are reported in the outcome but still consume the interval:
    /// delivery is at most once per interval.
    pub fn tick<T, B, W, S>(
        &mut self,
        now_ms: u64,
        mode: &ServiceMode,
        sensor: &mut T,
        broadcaster: &B,
        clock: &W,
        log: &DataLog<S>,
    ) -> ReportOutcome
    where
        T: TemperatureSensor + ?Sized,
        B: Broadcaster + ?Sized,
        W: WallClock + ?Sized,
        S: Storage,
    {
        if mode.get() {
            return ReportOutcome::Paused;
        }

        sensor.request_reading();
        let celsius = match sensor.read_celsius() {
            TemperatureReading::Celsius(celsius) => celsius,
            TemperatureReading::Disconnected => return ReportOutcome::SensorDisconnected,
        };

        if !self.is_due(now_ms) {
            return ReportOutcome::NotDue { celsius };
        }

        broadcaster.broadcast(&format_reading(celsius));

        let line = format_log_line(&clock.timestamp(), celsius);
        let append = log.append_line(&line);
        let regenerate = log.regenerate_csv();
        self.last_report_ms = now_ms;

        ReportOutcome::Reported {
            celsius,
            line,
            append,
            regenerate,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, collections::VecDeque};

    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{CSV_LOG_PATH, TEXT_LOG_PATH},
        storage::{tests::FailingStorage, MemoryStorage},
    };

    pub(crate) struct ScriptedSensor {
        pub readings: VecDeque<TemperatureReading>,
        pub fallback: TemperatureReading,
        pub requests: usize,
    }

    impl ScriptedSensor {
        pub fn constant(celsius: f32) -> Self {
            Self {
                readings: VecDeque::new(),
                fallback: TemperatureReading::Celsius(celsius),
                requests: 0,
            }
        }
    }

    impl TemperatureSensor for ScriptedSensor {
        fn request_reading(&mut self) {
            self.requests += 1;
        }

        fn read_celsius(&mut self) -> TemperatureReading {
            self.readings.pop_front().unwrap_or(self.fallback)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingBroadcaster {
        pub sent: RefCell<Vec<String>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, text: &str) {
            self.sent.borrow_mut().push(text.to_string());
        }
    }

    pub(crate) struct FixedClock(pub NaiveDateTime);

    impl FixedClock {
        pub fn noon() -> Self {
            Self(
                NaiveDate::from_ymd_opt(2024, 5, 17)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
            )
        }
    }

    impl WallClock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    fn data_log() -> DataLog<MemoryStorage> {
        DataLog::new(MemoryStorage::new(), TEXT_LOG_PATH, CSV_LOG_PATH)
    }

    #[test]
    fn reports_sample_when_interval_elapsed() {
        let mut reporter = Reporter::new(30_000);
        let mut sensor = ScriptedSensor::constant(23.5);
        let broadcaster = RecordingBroadcaster::default();
        let log = data_log();

        let outcome = reporter.tick(
            30_000,
            &ServiceMode::new(),
            &mut sensor,
            &broadcaster,
            &FixedClock::noon(),
            &log,
        );

        assert!(matches!(outcome, ReportOutcome::Reported { .. }));
        assert_eq!(*broadcaster.sent.borrow(), vec!["23.50".to_string()]);
        assert_eq!(
            String::from_utf8(log.read_text().unwrap().unwrap()).unwrap(),
            "2024-05-17 12:00:00 - 23.50 °C \n"
        );
        assert_eq!(
            String::from_utf8(log.read_csv().unwrap().unwrap()).unwrap(),
            "Timestamp,Temperature\n2024-05-17 12:00:00 - 23.50 °C \n\n"
        );
        assert_eq!(reporter.last_report_ms(), 30_000);
    }

    #[test]
    fn storage_failure_still_broadcasts_and_consumes_interval() {
        let mut reporter = Reporter::new(30_000);
        let mut sensor = ScriptedSensor::constant(22.0);
        let broadcaster = RecordingBroadcaster::default();
        let mode = ServiceMode::new();
        let clock = FixedClock::noon();
        let log = DataLog::new(
            FailingStorage::rejecting_writes(),
            TEXT_LOG_PATH,
            CSV_LOG_PATH,
        );

        let outcome = reporter.tick(30_000, &mode, &mut sensor, &broadcaster, &clock, &log);
        assert!(matches!(
            outcome,
            ReportOutcome::Reported {
                append: Err(StorageError::Write { .. }),
                regenerate: Err(StorageError::NotFound(_)),
                ..
            }
        ));
        assert_eq!(*broadcaster.sent.borrow(), vec!["22.00".to_string()]);
        assert_eq!(reporter.last_report_ms(), 30_000);

        let next = reporter.tick(32_000, &mode, &mut sensor, &broadcaster, &clock, &log);
        assert!(matches!(next, ReportOutcome::NotDue { .. }));
        assert_eq!(broadcaster.sent.borrow().len(), 1);
    }

    #[test]
    fn interval_gates_reports() {
        let mut reporter = Reporter::new(10_000);
        let mut sensor = ScriptedSensor::constant(20.0);
        let broadcaster = RecordingBroadcaster::default();
        let log = data_log();
        let mode = ServiceMode::new();
        let clock = FixedClock::noon();

        let mut reported_at = Vec::new();
        for now_ms in (0..=32_000).step_by(2_000) {
            let outcome = reporter.tick(now_ms, &mode, &mut sensor, &broadcaster, &clock, &log);
            if matches!(outcome, ReportOutcome::Reported { .. }) {
                reported_at.push(now_ms);
            }
        }

        assert_eq!(reported_at, vec![10_000, 20_000, 30_000]);
        assert_eq!(broadcaster.sent.borrow().len(), 3);
    }

    #[test]
    fn disconnected_sensor_skips_everything() {
        let mut reporter = Reporter::new(1_000);
        let mut sensor = ScriptedSensor::constant(20.0);
        sensor
            .readings
            .push_back(TemperatureReading::from_raw(DISCONNECTED_CELSIUS));
        let broadcaster = RecordingBroadcaster::default();
        let log = data_log();

        let outcome = reporter.tick(
            5_000,
            &ServiceMode::new(),
            &mut sensor,
            &broadcaster,
            &FixedClock::noon(),
            &log,
        );

        assert!(matches!(outcome, ReportOutcome::SensorDisconnected));
        assert!(broadcaster.sent.borrow().is_empty());
        assert!(log.read_text().unwrap().is_none());
        assert_eq!(reporter.last_report_ms(), 0);
    }

    #[test]
    fn service_mode_pauses_sampling() {
        let mut reporter = Reporter::new(1_000);
        let mut sensor = ScriptedSensor::constant(20.0);
        let mode = ServiceMode::new();
        mode.set(true);

        let outcome = reporter.tick(
            5_000,
            &mode,
            &mut sensor,
            &RecordingBroadcaster::default(),
            &FixedClock::noon(),
            &data_log(),
        );

        assert!(matches!(outcome, ReportOutcome::Paused));
        assert_eq!(sensor.requests, 0);
    }

    #[test]
    fn sensor_is_polled_even_when_not_due() {
        let mut reporter = Reporter::new(60_000);
        let mut sensor = ScriptedSensor::constant(18.0);

        let outcome = reporter.tick(
            2_000,
            &ServiceMode::new(),
            &mut sensor,
            &RecordingBroadcaster::default(),
            &FixedClock::noon(),
            &data_log(),
        );

        assert!(matches!(outcome, ReportOutcome::NotDue { .. }));
        assert_eq!(sensor.requests, 1);
    }

    #[test]
    fn raw_values_map_to_readings() {
        assert_eq!(
            TemperatureReading::from_raw(-127.0),
            TemperatureReading::Disconnected
        );
        assert_eq!(
            TemperatureReading::from_raw(f32::NAN),
            TemperatureReading::Disconnected
        );
        assert_eq!(
            TemperatureReading::from_raw(-10.5),
            TemperatureReading::Celsius(-10.5)
        );
    }
}

//! Precondition checks that gate destructive operations.
//!
//! Reflashing an ECU with the engine running, or clearing codes on a dying
//! battery, bricks modules. Every destructive operation is therefore checked
//! against a snapshot of vehicle conditions before a single byte goes out on
//! the wire. Issues classified [IssueSeverity::Error] block the operation;
//! warnings are surfaced but do not.

use strum_macros::Display;

/// Selector position of the transmission
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum GearPosition {
    /// Park
    Park,
    /// Reverse
    Reverse,
    /// Neutral
    Neutral,
    /// Drive or any forward gear
    Drive,
    /// Selector position not reported
    Unknown,
}

/// Snapshot of the vehicle state, read immediately before a gated operation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VehicleConditions {
    /// Engine is turning
    pub engine_running: bool,
    /// Voltage at the diagnostic connector, volts
    pub bus_voltage: f32,
    /// Road speed, km/h
    pub vehicle_speed: f32,
    /// Engine speed, rpm
    pub engine_rpm: u32,
    /// Transmission selector position
    pub transmission_position: GearPosition,
    /// Brake pedal is pressed
    pub brake_applied: bool,
    /// Outside air temperature, Celsius
    pub ambient_temperature: f32,
}

impl VehicleConditions {
    /// A stationary vehicle with the ignition on and the engine off.
    pub fn key_on_engine_off(bus_voltage: f32) -> Self {
        Self {
            engine_running: false,
            bus_voltage,
            vehicle_speed: 0.0,
            engine_rpm: 0,
            transmission_position: GearPosition::Park,
            brake_applied: false,
            ambient_temperature: 20.0,
        }
    }
}

/// Source of live vehicle condition snapshots.
pub trait ConditionSource: Send {
    /// Reads the current conditions. Errors come back as a string because
    /// they only ever feed log output; a failed read blocks the operation.
    fn read_conditions(&mut self) -> Result<VehicleConditions, String>;
}

/// Operations that require a precondition check
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum GatedOperation {
    /// Reflashing an ECU
    EcuProgramming,
    /// Writing coding/adaptation data
    EcuCoding,
    /// Clearing stored trouble codes
    DtcClearing,
    /// Any diagnostic session change
    SessionChange,
    /// Entering the programming session specifically
    ProgrammingSession,
    /// Entering the safety-system session
    SafetySystemSession,
}

/// What a precondition check found wrong
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum SafetyIssueKind {
    /// Bus voltage outside the window for this operation
    VoltageOutOfRange,
    /// Engine must be off for this operation
    EngineRunning,
    /// Transmission must be in park or neutral
    TransmissionNotNeutral,
    /// Vehicle must be stationary (or below the allowed ceiling)
    VehicleMoving,
}

/// Whether an issue blocks the operation or is merely surfaced
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum IssueSeverity {
    /// Blocks the operation
    Error,
    /// Surfaced to the caller, does not block
    Warning,
}

/// One finding of a precondition check
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyIssue {
    /// What is wrong
    pub kind: SafetyIssueKind,
    /// Whether it blocks
    pub severity: IssueSeverity,
    /// Human readable detail
    pub message: String,
}

impl SafetyIssue {
    fn error(kind: SafetyIssueKind, message: String) -> Self {
        Self {
            kind,
            severity: IssueSeverity::Error,
            message,
        }
    }

    fn warning(kind: SafetyIssueKind, message: String) -> Self {
        Self {
            kind,
            severity: IssueSeverity::Warning,
            message,
        }
    }
}

/// Outcome of a precondition check that found issues
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyReport {
    /// Operation that was checked
    pub operation: GatedOperation,
    /// Everything the check found, errors first
    pub issues: Vec<SafetyIssue>,
}

impl SafetyReport {
    /// True when any issue blocks the operation
    pub fn is_blocking(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error)
    }
}

impl std::fmt::Display for SafetyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.operation)?;
        for (pos, issue) in self.issues.iter().enumerate() {
            if pos > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({})", issue.kind, issue.severity)?;
        }
        Ok(())
    }
}

fn check_voltage_window(
    issues: &mut Vec<SafetyIssue>,
    voltage: f32,
    min: f32,
    max: Option<f32>,
) {
    if voltage < min {
        issues.push(SafetyIssue::error(
            SafetyIssueKind::VoltageOutOfRange,
            format!("bus voltage {voltage:.1} V below minimum {min:.1} V"),
        ));
    } else if let Some(max) = max {
        if voltage > max {
            issues.push(SafetyIssue::error(
                SafetyIssueKind::VoltageOutOfRange,
                format!("bus voltage {voltage:.1} V above maximum {max:.1} V"),
            ));
        }
    }
}

fn require_engine_off(issues: &mut Vec<SafetyIssue>, conditions: &VehicleConditions) {
    if conditions.engine_running || conditions.engine_rpm > 0 {
        issues.push(SafetyIssue::error(
            SafetyIssueKind::EngineRunning,
            format!("engine running at {} rpm", conditions.engine_rpm),
        ));
    }
}

fn require_stationary(issues: &mut Vec<SafetyIssue>, conditions: &VehicleConditions, max_kmh: f32) {
    if conditions.vehicle_speed > max_kmh {
        issues.push(SafetyIssue::error(
            SafetyIssueKind::VehicleMoving,
            format!(
                "vehicle moving at {:.0} km/h (limit {:.0})",
                conditions.vehicle_speed, max_kmh
            ),
        ));
    }
}

/// Checks `operation` against `conditions`.
///
/// `Ok(warnings)` allows the operation (warnings may still be non-empty);
/// `Err(report)` blocks it without any wire activity.
pub fn check_preconditions(
    operation: GatedOperation,
    conditions: &VehicleConditions,
) -> Result<Vec<SafetyIssue>, SafetyReport> {
    let mut issues = Vec::new();
    match operation {
        GatedOperation::EcuProgramming => {
            check_voltage_window(&mut issues, conditions.bus_voltage, 11.0, Some(14.5));
            require_engine_off(&mut issues, conditions);
            if !matches!(
                conditions.transmission_position,
                GearPosition::Park | GearPosition::Neutral
            ) {
                issues.push(SafetyIssue::error(
                    SafetyIssueKind::TransmissionNotNeutral,
                    format!(
                        "transmission in {}, need P or N",
                        conditions.transmission_position
                    ),
                ));
            }
            require_stationary(&mut issues, conditions, 0.0);
        }
        GatedOperation::EcuCoding => {
            check_voltage_window(&mut issues, conditions.bus_voltage, 12.0, None);
            if conditions.engine_running {
                issues.push(SafetyIssue::warning(
                    SafetyIssueKind::EngineRunning,
                    "coding with the engine running is not recommended".into(),
                ));
            }
        }
        GatedOperation::DtcClearing => {
            check_voltage_window(&mut issues, conditions.bus_voltage, 10.5, None);
        }
        GatedOperation::SessionChange => {
            check_voltage_window(&mut issues, conditions.bus_voltage, 10.0, None);
        }
        GatedOperation::ProgrammingSession => {
            check_voltage_window(&mut issues, conditions.bus_voltage, 11.5, None);
            require_engine_off(&mut issues, conditions);
            if conditions.transmission_position != GearPosition::Park {
                issues.push(SafetyIssue::error(
                    SafetyIssueKind::TransmissionNotNeutral,
                    format!(
                        "transmission in {}, need P",
                        conditions.transmission_position
                    ),
                ));
            }
            require_stationary(&mut issues, conditions, 0.0);
        }
        GatedOperation::SafetySystemSession => {
            if conditions.engine_running {
                issues.push(SafetyIssue::warning(
                    SafetyIssueKind::EngineRunning,
                    "safety-system work with the engine running".into(),
                ));
            }
            require_stationary(&mut issues, conditions, 5.0);
        }
    }

    let blocking = issues.iter().any(|i| i.severity == IssueSeverity::Error);
    if blocking {
        issues.sort_by_key(|i| match i.severity {
            IssueSeverity::Error => 0,
            IssueSeverity::Warning => 1,
        });
        Err(SafetyReport { operation, issues })
    } else {
        Ok(issues)
    }
}

//! Telemetry field registry and change tracking.
//!
//! Every externally visible value — measured telemetry and tunable
//! configuration alike — has a [`Field`] identifier and a stable text name.
//! The core marks fields dirty as they change; an outer transport (out of
//! scope here) drains the [`DirtySet`] to publish only what moved.

/// Externally visible fields, both read-only telemetry and writable config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Field {
    // Telemetry (read-only)
    State,
    InVolt,
    OutVolt,
    OutCurr,
    OutPower,
    CurrFilt,
    OutputEn,
    EnergyWh,
    Collapses,

    // Configuration (read-write)
    Pgain,
    RampLimit,
    Setpoint,
    Vadjust,
    MeasPeriod,
    AdjustPeriod,
    PrintPeriod,
    AutoSweep,
    CurrentCap,
    OffThreshold,
}

impl Field {
    /// All fields, in publication order.
    pub const ALL: [Field; 19] = [
        Field::State,
        Field::InVolt,
        Field::OutVolt,
        Field::OutCurr,
        Field::OutPower,
        Field::CurrFilt,
        Field::OutputEn,
        Field::EnergyWh,
        Field::Collapses,
        Field::Pgain,
        Field::RampLimit,
        Field::Setpoint,
        Field::Vadjust,
        Field::MeasPeriod,
        Field::AdjustPeriod,
        Field::PrintPeriod,
        Field::AutoSweep,
        Field::CurrentCap,
        Field::OffThreshold,
    ];

    /// Stable text name used by the get/set command surface.
    pub fn name(self) -> &'static str {
        match self {
            Field::State => "state",
            Field::InVolt => "involt",
            Field::OutVolt => "outvolt",
            Field::OutCurr => "outcurr",
            Field::OutPower => "outpower",
            Field::CurrFilt => "currfilt",
            Field::OutputEn => "outputen",
            Field::EnergyWh => "wh",
            Field::Collapses => "collapses",
            Field::Pgain => "pgain",
            Field::RampLimit => "ramplimit",
            Field::Setpoint => "setpoint",
            Field::Vadjust => "vadjust",
            Field::MeasPeriod => "measperiod",
            Field::AdjustPeriod => "adjustperiod",
            Field::PrintPeriod => "printperiod",
            Field::AutoSweep => "autosweep",
            Field::CurrentCap => "currentcap",
            Field::OffThreshold => "offthreshold",
        }
    }

    /// Reverse lookup for the text command surface.
    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// True for pure measurements that reject writes. Output voltage,
    /// current, enable, and the energy counter are *not* read-only: writes
    /// to those pass straight through to the supply.
    pub fn read_only(self) -> bool {
        matches!(
            self,
            Field::State
                | Field::InVolt
                | Field::OutPower
                | Field::CurrFilt
                | Field::Collapses
        )
    }

    /// Fields whose writes are commands to the supply, not config edits.
    pub fn psu_backed(self) -> bool {
        matches!(
            self,
            Field::OutVolt | Field::OutCurr | Field::OutputEn | Field::EnergyWh
        )
    }

    fn mask(self) -> u32 {
        1 << (self as u8)
    }
}

/// Bitset of fields whose values changed since the last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtySet(u32);

impl DirtySet {
    pub fn new() -> Self {
        Self(0)
    }

    /// Mark a single field as changed.
    pub fn mark(&mut self, field: Field) {
        self.0 |= field.mask();
    }

    /// Mark every field dirty (used after reconnect / reconfiguration).
    pub fn mark_all(&mut self) {
        for f in Field::ALL {
            self.mark(f);
        }
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0 & field.mask() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Drain: returns the dirty fields in publication order and clears the set.
    pub fn take(&mut self) -> impl Iterator<Item = Field> {
        let taken = self.0;
        self.0 = 0;
        Field::ALL
            .into_iter()
            .filter(move |f| taken & f.mask() != 0)
    }
}

use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{impl_default, Error, ErrorKind, Result};

/// User-facing temperature preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum TempUnit {
    #[default]
    #[serde(rename = "degC")]
    Celsius,
    #[serde(rename = "degF")]
    Fahrenheit,
}

impl From<TempUnit> for &'static str {
    fn from(unit: TempUnit) -> Self {
        match unit {
            TempUnit::Celsius => "degC",
            TempUnit::Fahrenheit => "degF",
        }
    }
}

impl From<&TempUnit> for &'static str {
    fn from(unit: &TempUnit) -> Self {
        (*unit).into()
    }
}

impl fmt::Display for TempUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

/// Wire-side unit families declared by field descriptors
///
/// The controller always stores metric values; the family names the exact
/// unit the wire integer is scaled from.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum UnitType {
    #[default]
    NotSet = 0,
    Celsius = 1,
    InverseCelsius = 2,
    Second = 3,
    Minute = 4,
    Hour = 5,
    DeltaCelsius = 6,
    DeltaCelsiusPerSecond = 7,
    DeltaCelsiusPerMinute = 8,
    DeltaCelsiusPerHour = 9,
    DeltaCelsiusMultSecond = 10,
    DeltaCelsiusMultMinute = 11,
    DeltaCelsiusMultHour = 12,
    MilliBar = 13,
    Volt = 14,
    Ohm = 15,
}

impl From<u8> for UnitType {
    fn from(b: u8) -> Self {
        match b {
            1 => Self::Celsius,
            2 => Self::InverseCelsius,
            3 => Self::Second,
            4 => Self::Minute,
            5 => Self::Hour,
            6 => Self::DeltaCelsius,
            7 => Self::DeltaCelsiusPerSecond,
            8 => Self::DeltaCelsiusPerMinute,
            9 => Self::DeltaCelsiusPerHour,
            10 => Self::DeltaCelsiusMultSecond,
            11 => Self::DeltaCelsiusMultMinute,
            12 => Self::DeltaCelsiusMultHour,
            13 => Self::MilliBar,
            14 => Self::Volt,
            15 => Self::Ohm,
            _ => Self::NotSet,
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Seconds per time base unit.
fn time_base_seconds(family: UnitType) -> f64 {
    match family {
        UnitType::Second | UnitType::DeltaCelsiusPerSecond | UnitType::DeltaCelsiusMultSecond => {
            1.0
        }
        UnitType::Minute | UnitType::DeltaCelsiusPerMinute | UnitType::DeltaCelsiusMultMinute => {
            60.0
        }
        UnitType::Hour | UnitType::DeltaCelsiusPerHour | UnitType::DeltaCelsiusMultHour => 3600.0,
        _ => 1.0,
    }
}

fn time_unit_seconds(unit: &str) -> Option<f64> {
    match unit {
        "second" => Some(1.0),
        "minute" => Some(60.0),
        "hour" => Some(3600.0),
        _ => None,
    }
}

fn time_unit_name(base: f64) -> &'static str {
    if base == 3600.0 {
        "hour"
    } else if base == 60.0 {
        "minute"
    } else {
        "second"
    }
}

/// Conversion between controller-native units and user units.
///
/// The controller is always metric; user-facing values follow the global
/// temperature preference. Conversions are exact affine transforms; rounding
/// is left to the codec.
#[derive(Debug)]
pub struct UnitConverter {
    temperature: RwLock<TempUnit>,
}

impl UnitConverter {
    /// Creates a converter with the Celsius default preference.
    pub fn new() -> Self {
        Self {
            temperature: RwLock::new(TempUnit::default()),
        }
    }

    /// Gets the current user temperature preference.
    pub fn temperature(&self) -> TempUnit {
        *self.temperature.read().expect("temperature lock poisoned")
    }

    /// Sets the user temperature preference.
    pub fn set_temperature(&self, unit: TempUnit) {
        *self.temperature.write().expect("temperature lock poisoned") = unit;
    }

    /// Gets the user-facing unit string for a wire unit family
    /// under the current preference.
    pub fn user_unit(&self, family: UnitType) -> &'static str {
        let fahrenheit = self.temperature() == TempUnit::Fahrenheit;

        match family {
            UnitType::NotSet => "",
            UnitType::Celsius => {
                if fahrenheit {
                    "degF"
                } else {
                    "degC"
                }
            }
            UnitType::InverseCelsius => {
                if fahrenheit {
                    "1 / degF"
                } else {
                    "1 / degC"
                }
            }
            UnitType::DeltaCelsius => {
                if fahrenheit {
                    "delta_degF"
                } else {
                    "delta_degC"
                }
            }
            UnitType::Second => "second",
            UnitType::Minute => "minute",
            UnitType::Hour => "hour",
            UnitType::DeltaCelsiusPerSecond => {
                if fahrenheit {
                    "delta_degF / second"
                } else {
                    "delta_degC / second"
                }
            }
            UnitType::DeltaCelsiusPerMinute => {
                if fahrenheit {
                    "delta_degF / minute"
                } else {
                    "delta_degC / minute"
                }
            }
            UnitType::DeltaCelsiusPerHour => {
                if fahrenheit {
                    "delta_degF / hour"
                } else {
                    "delta_degC / hour"
                }
            }
            UnitType::DeltaCelsiusMultSecond => {
                if fahrenheit {
                    "delta_degF * second"
                } else {
                    "delta_degC * second"
                }
            }
            UnitType::DeltaCelsiusMultMinute => {
                if fahrenheit {
                    "delta_degF * minute"
                } else {
                    "delta_degC * minute"
                }
            }
            UnitType::DeltaCelsiusMultHour => {
                if fahrenheit {
                    "delta_degF * hour"
                } else {
                    "delta_degC * hour"
                }
            }
            UnitType::MilliBar => "mbar",
            UnitType::Volt => "volt",
            UnitType::Ohm => "ohm",
        }
    }

    /// Converts a value in the named user unit into the family's wire unit.
    ///
    /// Returns `UNKNOWN_UNIT` when the unit string does not belong
    /// to the field's family.
    pub fn to_wire(&self, family: UnitType, value: f64, unit: &str) -> Result<f64> {
        let unit = normalize(unit);

        let converted = match family {
            UnitType::NotSet => None,
            UnitType::Celsius => match unit.as_str() {
                "degC" => Some(value),
                "degF" => Some((value - 32.0) * 5.0 / 9.0),
                _ => None,
            },
            UnitType::InverseCelsius => match unit.as_str() {
                "1/degC" => Some(value),
                // One unit per degree Fahrenheit is 9/5 units per degree Celsius
                "1/degF" => Some(value * 9.0 / 5.0),
                _ => None,
            },
            UnitType::DeltaCelsius => match unit.as_str() {
                "delta_degC" => Some(value),
                "delta_degF" => Some(value * 5.0 / 9.0),
                _ => None,
            },
            UnitType::Second | UnitType::Minute | UnitType::Hour => time_unit_seconds(&unit)
                .map(|unit_base| value * unit_base / time_base_seconds(family)),
            UnitType::DeltaCelsiusPerSecond
            | UnitType::DeltaCelsiusPerMinute
            | UnitType::DeltaCelsiusPerHour => {
                split_compound(&unit, '/').and_then(|(delta, time)| {
                    let factor = delta_factor(delta)?;
                    let unit_base = time_unit_seconds(time)?;
                    // Rates scale inversely with the time unit
                    Some(value * factor * time_base_seconds(family) / unit_base)
                })
            }
            UnitType::DeltaCelsiusMultSecond
            | UnitType::DeltaCelsiusMultMinute
            | UnitType::DeltaCelsiusMultHour => {
                split_compound(&unit, '*').and_then(|(delta, time)| {
                    let factor = delta_factor(delta)?;
                    let unit_base = time_unit_seconds(time)?;
                    Some(value * factor * unit_base / time_base_seconds(family))
                })
            }
            UnitType::MilliBar => match unit.as_str() {
                "mbar" => Some(value),
                "bar" => Some(value * 1000.0),
                _ => None,
            },
            UnitType::Volt => match unit.as_str() {
                "volt" => Some(value),
                _ => None,
            },
            UnitType::Ohm => match unit.as_str() {
                "ohm" => Some(value),
                _ => None,
            },
        };

        converted.ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownUnit,
                format!("cannot convert '{unit}' to {family}"),
            )
        })
    }

    /// Converts a wire-unit value into the current user unit.
    pub fn to_user(&self, family: UnitType, value: f64) -> f64 {
        let fahrenheit = self.temperature() == TempUnit::Fahrenheit;

        match family {
            UnitType::Celsius => {
                if fahrenheit {
                    value * 9.0 / 5.0 + 32.0
                } else {
                    value
                }
            }
            UnitType::InverseCelsius => {
                if fahrenheit {
                    value * 5.0 / 9.0
                } else {
                    value
                }
            }
            UnitType::DeltaCelsius
            | UnitType::DeltaCelsiusPerSecond
            | UnitType::DeltaCelsiusPerMinute
            | UnitType::DeltaCelsiusPerHour
            | UnitType::DeltaCelsiusMultSecond
            | UnitType::DeltaCelsiusMultMinute
            | UnitType::DeltaCelsiusMultHour => {
                if fahrenheit {
                    value * 9.0 / 5.0
                } else {
                    value
                }
            }
            _ => value,
        }
    }
}

impl_default!(UnitConverter);

/// Strips whitespace so `"delta_degC / second"` and `"delta_degC/second"`
/// compare equal.
fn normalize(unit: &str) -> String {
    unit.chars().filter(|c| !c.is_whitespace()).collect()
}

fn split_compound(unit: &str, op: char) -> Option<(&str, &str)> {
    let (left, right) = unit.split_once(op)?;
    Some((left, right))
}

fn delta_factor(unit: &str) -> Option<f64> {
    match unit {
        "delta_degC" => Some(1.0),
        "delta_degF" => Some(5.0 / 9.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_to_wire() -> Result<()> {
        let converter = UnitConverter::new();

        assert_eq!(converter.to_wire(UnitType::Celsius, 20.0, "degC")?, 20.0);
        assert_eq!(converter.to_wire(UnitType::Celsius, 212.0, "degF")?, 100.0);
        assert!((converter.to_wire(UnitType::DeltaCelsius, 20.0, "delta_degF")? - 100.0 / 9.0)
            .abs()
            < 1e-9);

        Ok(())
    }

    #[test]
    fn test_unknown_unit() {
        let converter = UnitConverter::new();
        let err = converter
            .to_wire(UnitType::Celsius, 1.0, "volt")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownUnit);
    }

    #[test]
    fn test_time_units() -> Result<()> {
        let converter = UnitConverter::new();

        assert_eq!(converter.to_wire(UnitType::Second, 2.0, "minute")?, 120.0);
        assert_eq!(converter.to_wire(UnitType::Hour, 1800.0, "second")?, 0.5);
        assert_eq!(converter.user_unit(UnitType::Minute), "minute");

        Ok(())
    }

    #[test]
    fn test_compound_units() -> Result<()> {
        let converter = UnitConverter::new();

        // 6 delta_degC per minute is 0.1 delta_degC per second
        assert!(
            (converter.to_wire(UnitType::DeltaCelsiusPerSecond, 6.0, "delta_degC / minute")?
                - 0.1)
                .abs()
                < 1e-9
        );
        // 2 delta_degC * hour is 120 delta_degC * minute
        assert_eq!(
            converter.to_wire(UnitType::DeltaCelsiusMultMinute, 2.0, "delta_degC * hour")?,
            120.0
        );

        Ok(())
    }

    #[test]
    fn test_user_preference() {
        let converter = UnitConverter::new();
        assert_eq!(converter.user_unit(UnitType::Celsius), "degC");
        assert_eq!(converter.to_user(UnitType::Celsius, 100.0), 100.0);

        converter.set_temperature(TempUnit::Fahrenheit);
        assert_eq!(converter.user_unit(UnitType::Celsius), "degF");
        assert_eq!(converter.user_unit(UnitType::DeltaCelsiusPerHour), "delta_degF / hour");
        assert_eq!(converter.to_user(UnitType::Celsius, 100.0), 212.0);
        assert_eq!(converter.to_user(UnitType::Second, 10.0), 10.0);
    }

    #[test]
    fn test_wire_user_round_trip() {
        let converter = UnitConverter::new();
        converter.set_temperature(TempUnit::Fahrenheit);

        for value in [-40.0, 0.0, 20.0, 68.5, 104.0] {
            let wire = converter
                .to_wire(UnitType::Celsius, value, "degF")
                .unwrap();
            let back = converter.to_user(UnitType::Celsius, wire);
            assert!((back - value).abs() < 1e-9, "{value} round-tripped to {back}");
        }
    }
}

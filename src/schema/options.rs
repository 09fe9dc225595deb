use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitfield! {
    /// Packed per-field option flags from the compiled descriptors.
    ///
    /// The boolean field options are folded into one word; options with a
    /// value (unit, scale, objtype) stay separate fields on
    /// [FieldSpec](super::FieldSpec).
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldFlags(u16);
    /// Wire bytes are rendered as a hex string user-side
    pub hexed, set_hexed: 0;
    /// Field is rejected by the controller on write
    pub readonly, set_readonly: 1;
    /// Field is included in logged views
    pub logged, set_logged: 2;
    /// Field is part of the persisted block settings
    pub stored, set_stored: 3;
    /// Wire string is rendered as hex of its bytes user-side
    pub hexstr, set_hexstr: 4;
    /// Field is stripped from decoded output
    pub ignored, set_ignored: 5;
    /// Wire integer decodes to an array of named flags
    pub bitfield, set_bitfield: 6;
    /// Wire integer seconds map to an ISO-8601 string user-side
    pub datetime, set_datetime: 7;
    /// Wire integer maps to a dotted-quad string user-side
    pub ipv4address, set_ipv4address: 8;
    /// Zero values are omitted from the encoded message
    pub omit_if_zero, set_omit_if_zero: 9;
    /// Explicit user null encodes as zero, and zero decodes to null
    pub null_if_zero, set_null_if_zero: 10;
}

const FLAG_NAMES: [(&str, usize); 11] = [
    ("hexed", 0),
    ("readonly", 1),
    ("logged", 2),
    ("stored", 3),
    ("hexstr", 4),
    ("ignored", 5),
    ("bitfield", 6),
    ("datetime", 7),
    ("ipv4address", 8),
    ("omit_if_zero", 9),
    ("null_if_zero", 10),
];

impl FieldFlags {
    /// Builds a flags word from descriptor option names.
    ///
    /// Unrecognized names are warned-and-ignored, so descriptors compiled
    /// against a newer option set still load.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut flags = Self::default();

        for name in names {
            let name = name.as_ref();
            match FLAG_NAMES.iter().find(|(flag, _)| *flag == name) {
                Some((_, bit)) => flags.0 |= 1 << bit,
                None => log::warn!("ignoring unknown field option '{name}'"),
            }
        }

        flags
    }

    /// Gets the names of all set options.
    pub fn names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, bit)| self.0 & (1 << bit) != 0)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Gets whether no option is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FieldFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldFlags({:?})", self.names())
    }
}

impl<'de> Deserialize<'de> for FieldFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let names = Vec::<String>::deserialize(deserializer)?;
        Ok(Self::from_names(&names))
    }
}

impl Serialize for FieldFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.names().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_round_trip() {
        let flags = FieldFlags::from_names(&["readonly", "logged", "datetime"]);

        assert!(flags.readonly());
        assert!(flags.logged());
        assert!(flags.datetime());
        assert!(!flags.hexed());
        assert!(!flags.is_empty());

        assert_eq!(flags.names(), vec!["readonly", "logged", "datetime"]);
        assert_eq!(FieldFlags::from_names(&flags.names()), flags);
    }

    #[test]
    fn test_empty_flags() {
        let flags = FieldFlags::default();
        assert!(flags.is_empty());
        assert!(flags.names().is_empty());
    }

    #[test]
    fn test_deserialize_from_names() {
        let flags: FieldFlags = serde_json::from_str(r#"["omit_if_zero", "hexed"]"#).unwrap();
        assert!(flags.omit_if_zero());
        assert!(flags.hexed());
        assert!(!flags.readonly());
    }
}

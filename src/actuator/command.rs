use crate::accessory::{Accessory, AccessorySet};
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Physical indices are single ASCII digits; `0` is reserved for retract-all.
pub const MAX_ACTUATORS: usize = 9;
pub const RETRACT_ALL_OPCODE: &str = "0";

pub type OpcodeBuffer = ArrayString<16>;
pub type ActuatorIndices = Vec<u8, MAX_ACTUATORS>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareCommand {
    RetractAll,
    /// Raise the listed actuators. Sorted, unique, each in `1..=9`.
    Deploy(ActuatorIndices),
}

impl HardwareCommand {
    /// Combine physical indices into one deploy command. Duplicates collapse.
    /// Returns `None` when nothing valid is left to raise.
    pub fn deploy(indices: impl IntoIterator<Item = u8>) -> Option<Self> {
        let unique: BTreeSet<u8> = indices
            .into_iter()
            .filter(|i| (1..=MAX_ACTUATORS as u8).contains(i))
            .collect();

        if unique.is_empty() {
            return None;
        }

        let packed: ActuatorIndices = unique.into_iter().take(MAX_ACTUATORS).collect();
        Some(HardwareCommand::Deploy(packed))
    }

    /// Opcode as sent on the wire, without the line terminator.
    pub fn opcode(&self) -> OpcodeBuffer {
        let mut buf = OpcodeBuffer::new();
        match self {
            HardwareCommand::RetractAll => buf.push_str(RETRACT_ALL_OPCODE),
            HardwareCommand::Deploy(indices) => {
                for index in indices {
                    buf.push(char::from(b'0' + index));
                }
            }
        }
        buf
    }

    pub fn is_retract(&self) -> bool {
        matches!(self, HardwareCommand::RetractAll)
    }
}

impl fmt::Display for HardwareCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.opcode())
    }
}

/// Result of translating accessories to physical actuators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    pub indices: BTreeSet<u8>,
    /// Accessories that made it into `indices`.
    pub mapped: AccessorySet,
    /// Accessories with no configured actuator.
    pub unmapped: AccessorySet,
}

/// Accessory → physical actuator index table.
///
/// The wiring of the rig has changed between builds, so the table always
/// comes from configuration. Several accessories may share one actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<Accessory, u8>", into = "BTreeMap<Accessory, u8>")]
pub struct ActuatorMap(BTreeMap<Accessory, u8>);

impl ActuatorMap {
    pub fn new(table: BTreeMap<Accessory, u8>) -> Result<Self, String> {
        for (accessory, index) in &table {
            if !(1..=MAX_ACTUATORS as u8).contains(index) {
                return Err(format!(
                    "actuator index {} for {} is outside 1..={}",
                    index, accessory, MAX_ACTUATORS
                ));
            }
        }
        Ok(Self(table))
    }

    pub fn index_of(&self, accessory: Accessory) -> Option<u8> {
        self.0.get(&accessory).copied()
    }

    pub fn translate(&self, needed: &AccessorySet) -> Translation {
        let mut translation = Translation::default();
        for &accessory in needed {
            match self.index_of(accessory) {
                Some(index) => {
                    translation.indices.insert(index);
                    translation.mapped.insert(accessory);
                }
                None => {
                    translation.unmapped.insert(accessory);
                }
            }
        }
        translation
    }

    pub fn entries(&self) -> impl Iterator<Item = (Accessory, u8)> + '_ {
        self.0.iter().map(|(a, i)| (*a, *i))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ActuatorMap {
    /// One actuator per accessory in declaration order. Real rigs override this.
    fn default() -> Self {
        Self(
            Accessory::ALL
                .iter()
                .zip(1u8..)
                .map(|(a, i)| (*a, i))
                .collect(),
        )
    }
}

impl TryFrom<BTreeMap<Accessory, u8>> for ActuatorMap {
    type Error = String;

    fn try_from(table: BTreeMap<Accessory, u8>) -> Result<Self, Self::Error> {
        Self::new(table)
    }
}

impl From<ActuatorMap> for BTreeMap<Accessory, u8> {
    fn from(map: ActuatorMap) -> Self {
        map.0
    }
}

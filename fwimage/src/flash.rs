// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fmt, ops::Range};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named region of a flash device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlashArea {
    pub name: String,
    pub id: u8,
    pub device: u8,
    pub offset: u32,
    pub size: u32,
}

impl FlashArea {
    /// Byte range covered by the area. This does not overflow because both
    /// fields are 32-bit.
    pub fn range(&self) -> Range<u64> {
        u64::from(self.offset)..u64::from(self.offset) + u64::from(self.size)
    }
}

/// A problem with a flash layout.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlashAreaError {
    #[error("Device {device}: Area {a:?} {a_range:#x?} overlaps area {b:?} {b_range:#x?}")]
    Overlap {
        device: u8,
        a: String,
        a_range: Range<u64>,
        b: String,
        b_range: Range<u64>,
    },
    #[error("Device {device}: Area ID {id} is used by multiple areas: {}", .names.join(", "))]
    DuplicateId {
        device: u8,
        id: u8,
        names: Vec<String>,
    },
}

struct Errors<'a>(&'a [FlashAreaError]);

impl fmt::Display for Errors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid flash layout: {}", Errors(.0))]
    Layout(Vec<FlashAreaError>),
    #[error("Failed to parse flash area list")]
    Parse(#[from] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Find every overlap between areas on the same device and every area ID that
/// is used more than once on the same device. Areas with a size of zero never
/// overlap anything.
pub fn detect_errors(areas: &[FlashArea]) -> Vec<FlashAreaError> {
    let mut errors = vec![];
    let mut by_device = BTreeMap::<u8, Vec<&FlashArea>>::new();

    for area in areas {
        by_device.entry(area.device).or_default().push(area);
    }

    for (device, mut device_areas) in by_device {
        let mut ids = BTreeMap::<u8, Vec<String>>::new();
        for area in &device_areas {
            ids.entry(area.id).or_default().push(area.name.clone());
        }

        for (id, names) in ids {
            if names.len() > 1 {
                errors.push(FlashAreaError::DuplicateId { device, id, names });
            }
        }

        device_areas.sort_by_key(|a| (a.offset, a.size));

        for (i, a) in device_areas.iter().enumerate() {
            let a_range = a.range();

            for b in &device_areas[i + 1..] {
                let b_range = b.range();

                // Sorted by offset, so nothing later can overlap either.
                if b_range.start >= a_range.end {
                    break;
                }

                if !b_range.is_empty() && !a_range.is_empty() {
                    errors.push(FlashAreaError::Overlap {
                        device,
                        a: a.name.clone(),
                        a_range: a_range.clone(),
                        b: b.name.clone(),
                        b_range,
                    });
                }
            }
        }
    }

    errors
}

/// Ensure that the layout has no overlapping areas or conflicting IDs.
pub fn validate(areas: &[FlashArea]) -> Result<()> {
    let errors = detect_errors(areas);
    if !errors.is_empty() {
        return Err(Error::Layout(errors));
    }

    Ok(())
}

#[derive(Deserialize)]
struct FlashAreaList {
    #[serde(default)]
    areas: Vec<FlashArea>,
}

/// Parse a flash area list in TOML format:
///
/// ```toml
/// [[areas]]
/// name = "boot"
/// id = 0
/// device = 0
/// offset = 0x0
/// size = 0x4000
/// ```
pub fn parse_area_list(text: &str) -> Result<Vec<FlashArea>> {
    let list: FlashAreaList = toml_edit::de::from_str(text)?;

    Ok(list.areas)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn area(name: &str, id: u8, device: u8, offset: u32, size: u32) -> FlashArea {
        FlashArea {
            name: name.to_owned(),
            id,
            device,
            offset,
            size,
        }
    }

    #[test]
    fn overlap_and_duplicate_id() {
        let areas = [
            area("boot", 0, 0, 0x0, 0x4000),
            area("slot0", 1, 0, 0x4000, 0x8000),
            area("slot1", 2, 0, 0xa000, 0x4000),
            area("scratch", 2, 0, 0x10000, 0x1000),
            // Same range on a different device is fine.
            area("ext", 0, 1, 0x4000, 0x8000),
            area("empty", 5, 0, 0x5000, 0),
        ];

        assert_eq!(
            detect_errors(&areas),
            vec![
                FlashAreaError::DuplicateId {
                    device: 0,
                    id: 2,
                    names: vec!["slot1".into(), "scratch".into()],
                },
                FlashAreaError::Overlap {
                    device: 0,
                    a: "slot0".into(),
                    a_range: 0x4000..0xc000,
                    b: "slot1".into(),
                    b_range: 0xa000..0xe000,
                },
            ],
        );

        assert_matches!(validate(&areas), Err(Error::Layout(e)) if e.len() == 2);
    }

    #[test]
    fn adjacent_areas() {
        let areas = [area("a", 0, 0, 0, 0x100), area("b", 1, 0, 0x100, 0x100)];
        assert!(validate(&areas).is_ok());
    }

    #[test]
    fn parse_list() {
        let areas = parse_area_list(
            r#"
            [[areas]]
            name = "boot"
            id = 0
            device = 0
            offset = 0x0
            size = 0x4000

            [[areas]]
            name = "slot0"
            id = 1
            device = 0
            offset = 0x4000
            size = 0x8000
            "#,
        )
        .unwrap();

        assert_eq!(
            areas,
            vec![area("boot", 0, 0, 0, 0x4000), area("slot0", 1, 0, 0x4000, 0x8000)],
        );

        assert_matches!(parse_area_list("[[areas]]\nname = 1"), Err(Error::Parse(_)));
    }
}

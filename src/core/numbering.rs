use serde::{Deserialize, Serialize};

/// FAT volume labels are limited to 11 characters.
const MAX_LABEL_LEN: usize = 11;

/// Placeholder in the label pattern replaced by the sequence number.
pub const NUMBER_PLACEHOLDER: &str = "{n}";

/// Auto-numbering of devices within a batch, used for exchange labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoNumbering {
    pub enabled: bool,
    pub start: u32,
    pub increment: u32,
    pub label_pattern: String,
}

impl Default for AutoNumbering {
    fn default() -> Self {
        Self {
            enabled: false,
            start: 1,
            increment: 1,
            label_pattern: "Exchange".to_string(),
        }
    }
}

impl AutoNumbering {
    /// Sequence number for the device at `index` (zero-based) in the batch.
    pub fn sequence_number(&self, index: usize) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let index = u32::try_from(index).ok()?;
        index
            .checked_mul(self.increment)
            .and_then(|offset| self.start.checked_add(offset))
    }

    /// Exchange partition label for a device with the given sequence number.
    pub fn exchange_label(&self, sequence_number: Option<u32>) -> String {
        let label = match sequence_number {
            Some(n) if self.label_pattern.contains(NUMBER_PLACEHOLDER) => {
                self.label_pattern.replace(NUMBER_PLACEHOLDER, &n.to_string())
            }
            Some(n) => format!("{}{}", self.label_pattern, n),
            None => self.label_pattern.replace(NUMBER_PLACEHOLDER, ""),
        };
        label.chars().take(MAX_LABEL_LEN).collect()
    }
}

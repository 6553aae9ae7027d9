use facet::Facet;
use tracing::warn;

/// Largest accepted `witness_capacity`. The relationship matrix is
/// quadratic in it.
pub const MAX_WITNESS_CAPACITY: u32 = 4096;

/// Largest accepted `lock_blocks`. Every block is allocated up front.
pub const MAX_LOCK_BLOCKS: u32 = 1 << 16;

/// Whether the checker verifies orders.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CheckMode {
    #[default]
    Enabled,
    /// Keep per-owner bookkeeping but skip order checks.
    Suspended,
    /// Permanently off.
    Off,
}

/// Two lock types whose reversal is known and accepted.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct BlessedPair {
    pub first: String,
    pub second: String,
}

/// A chain of lock types of one class, always acquired in the listed order.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct OrderHint {
    pub class: String,
    pub names: Vec<String>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct WitnessConfig {
    /// Maximum number of distinct lock types.
    pub witness_capacity: u32,
    /// Number of lock list blocks shared by all owners.
    pub lock_blocks: u32,
    /// Maximum number of first-seen order edges kept with their stacks.
    pub order_log_capacity: u32,
    pub mode: CheckMode,
    pub panic_on_violation: bool,
    /// Do not track spin locks at all.
    pub skip_spin: bool,
    /// Append stacks to reversal reports.
    pub trace: bool,
    pub blessed: Vec<BlessedPair>,
    pub order_hints: Vec<OrderHint>,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            witness_capacity: 1024,
            lock_blocks: 2048,
            order_log_capacity: 4096,
            mode: CheckMode::Enabled,
            panic_on_violation: false,
            skip_spin: false,
            trace: true,
            blessed: Vec::new(),
            order_hints: Vec::new(),
        }
    }
}

impl WitnessConfig {
    /// Small tables, handy for tests and short-lived tools.
    pub fn small() -> Self {
        Self {
            witness_capacity: 32,
            lock_blocks: 16,
            order_log_capacity: 64,
            ..Self::default()
        }
    }

    /// Table sizes capped to what the checker is willing to allocate.
    pub(crate) fn clamped(mut self) -> Self {
        if self.witness_capacity > MAX_WITNESS_CAPACITY {
            warn!(
                requested = self.witness_capacity,
                max = MAX_WITNESS_CAPACITY,
                "witness_capacity capped"
            );
            self.witness_capacity = MAX_WITNESS_CAPACITY;
        }
        if self.lock_blocks > MAX_LOCK_BLOCKS {
            warn!(requested = self.lock_blocks, max = MAX_LOCK_BLOCKS, "lock_blocks capped");
            self.lock_blocks = MAX_LOCK_BLOCKS;
        }
        self
    }

    pub(crate) fn is_blessed(&self, a: &str, b: &str) -> bool {
        self.blessed
            .iter()
            .any(|pair| (pair.first == a && pair.second == b) || (pair.first == b && pair.second == a))
    }
}

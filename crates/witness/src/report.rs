use compact_str::CompactString;
use witness_types::Source;

use crate::error::LockLabel;

/// A lock and the place it was acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldSite {
    pub lock: LockLabel,
    pub site: Source,
}

impl HeldSite {
    fn line(&self, ordinal: &str) -> String {
        format!(
            " {ordinal} {} ({}, {}) @ {}",
            self.lock.name, self.lock.type_name, self.lock.class, self.site
        )
    }
}

/// Two locks of one type held back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    pub type_name: CompactString,
    pub first: HeldSite,
    pub second: HeldSite,
}

impl DuplicateReport {
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("acquiring duplicate lock of same type: \"{}\"", self.type_name),
            format!(" 1st {} @ {}", self.first.lock.name, self.first.site),
            format!(" 2nd {} @ {}", self.second.lock.name, self.second.site),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalKind {
    Plain,
    SleepableAfterNonSleepable,
}

/// A lock taken against an order seen before.
///
/// `first` is the held lock, `second` the one being acquired. `earlier` is an
/// older held lock of the acquiring type, listed ahead of the other two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversalReport {
    pub kind: ReversalKind,
    pub first: HeldSite,
    pub second: HeldSite,
    pub earlier: Option<HeldSite>,
    /// Rendered stack of the offending acquisition.
    pub stack: Option<String>,
    /// The order that was contradicted and the rendered stack that first
    /// established it.
    pub established: Option<(CompactString, CompactString, String)>,
}

impl ReversalReport {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![match self.kind {
            ReversalKind::Plain => "lock order reversal:".to_owned(),
            ReversalKind::SleepableAfterNonSleepable => {
                "lock order reversal: (sleepable after non-sleepable)".to_owned()
            }
        }];
        match &self.earlier {
            None => {
                lines.push(self.first.line("1st"));
                lines.push(self.second.line("2nd"));
            }
            Some(earlier) => {
                lines.push(earlier.line("1st"));
                lines.push(self.first.line("2nd"));
                lines.push(self.second.line("3rd"));
            }
        }
        if let Some(stack) = &self.stack {
            lines.push("stack backtrace:".to_owned());
            lines.extend(stack.lines().map(str::to_owned));
        }
        if let Some((from, to, stack)) = &self.established {
            lines.push(format!("lock order {from} -> {to} established at:"));
            lines.extend(stack.lines().map(str::to_owned));
        }
        lines
    }
}

/// A non-fatal ordering problem found on acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Duplicate(DuplicateReport),
    Reversal(ReversalReport),
}

impl Violation {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Duplicate(report) => report.lines(),
            Self::Reversal(report) => report.lines(),
        }
    }

    /// The first line of the report.
    pub fn headline(&self) -> String {
        self.lines().into_iter().next().unwrap_or_default()
    }
}

//! Counter keys identifying one quota bucket.

use std::fmt;

/// A namespaced identifier of one counter.
///
/// Each dimension has its own marker, so counters of different dimensions never
/// share storage even when principals and models have the same names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Attempted requests across all principals and models.
    GlobalTotal,
    /// Attempted requests for one model across all principals.
    GlobalModel {
        /// Model name.
        model: String,
    },
    /// Successful requests of one principal.
    UserSuccess {
        /// Principal identifier.
        principal: String,
    },
    /// Attempted requests of one principal.
    UserTotal {
        /// Principal identifier.
        principal: String,
    },
    /// Attempted requests of one principal for one model.
    UserModel {
        /// Principal identifier.
        principal: String,
        /// Model name.
        model: String,
    },
}

impl CounterKey {
    /// The marker that namespaces this counter.
    pub fn marker(&self) -> &'static str {
        match self {
            CounterKey::GlobalTotal => "GRRL",
            CounterKey::GlobalModel { .. } => "GRRLM",
            CounterKey::UserSuccess { .. } => "MRRLS",
            CounterKey::UserTotal { .. } => "MRRL",
            CounterKey::UserModel { .. } => "MRRLM",
        }
    }

    /// Canonical serialization, used verbatim as the storage key suffix.
    ///
    /// Identifiers are escaped so a `:` inside a principal or model name cannot
    /// produce the same key as a different (principal, model) pair.
    pub fn canonical(&self) -> String {
        let marker = self.marker();

        match self {
            CounterKey::GlobalTotal => format!("{marker}:global"),
            CounterKey::GlobalModel { model } => format!("{marker}:global:{}", escape(model)),
            CounterKey::UserSuccess { principal } | CounterKey::UserTotal { principal } => {
                format!("{marker}:{}", escape(principal))
            }
            CounterKey::UserModel { principal, model } => {
                format!("{marker}:{}:{}", escape(principal), escape(model))
            }
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn escape(identifier: &str) -> String {
    let mut escaped = String::with_capacity(identifier.len());

    for c in identifier.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }

    escaped
}

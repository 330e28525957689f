//! Bulk copy options.

use serde::{Deserialize, Serialize};

/// Default timeout for one batch round trip, in seconds.
pub const DEFAULT_BULK_COPY_TIMEOUT_SECS: u64 = 60;

/// Options for one bulk copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkCopyOptions {
    /// Wrap the whole copy in one transaction; a failure rolls back every batch.
    pub use_internal_transaction: bool,

    /// Send encrypted column values without decrypting them.
    pub allow_encrypted_value_modifications: bool,

    /// Rows per batch. 0 sends the whole source as one batch.
    pub batch_size: usize,

    /// Seconds allowed for each batch round trip. 0 waits indefinitely.
    pub bulk_copy_timeout_secs: u64,

    /// Enforce check constraints while inserting.
    pub check_constraints: bool,

    /// Fire insert triggers on the destination table.
    pub fire_triggers: bool,

    /// Keep source values for identity columns instead of generating them.
    pub keep_identity: bool,

    /// Keep NULLs instead of applying column defaults.
    pub keep_nulls: bool,

    /// Take a bulk update table lock for the duration of the copy.
    pub table_lock: bool,
}

impl Default for BulkCopyOptions {
    fn default() -> Self {
        Self {
            use_internal_transaction: false,
            allow_encrypted_value_modifications: false,
            batch_size: 0,
            bulk_copy_timeout_secs: DEFAULT_BULK_COPY_TIMEOUT_SECS,
            check_constraints: false,
            fire_triggers: false,
            keep_identity: false,
            keep_nulls: false,
            table_lock: false,
        }
    }
}

/// A boolean bulk copy option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionFlag {
    UseInternalTransaction,
    AllowEncryptedValueModifications,
    CheckConstraints,
    FireTriggers,
    KeepIdentity,
    KeepNulls,
    TableLock,
}

impl OptionFlag {
    /// Every flag, in declaration order.
    pub const ALL: [OptionFlag; 7] = [
        OptionFlag::UseInternalTransaction,
        OptionFlag::AllowEncryptedValueModifications,
        OptionFlag::CheckConstraints,
        OptionFlag::FireTriggers,
        OptionFlag::KeepIdentity,
        OptionFlag::KeepNulls,
        OptionFlag::TableLock,
    ];

    /// Property name of the flag.
    pub fn name(self) -> &'static str {
        match self {
            OptionFlag::UseInternalTransaction => "useInternalTransaction",
            OptionFlag::AllowEncryptedValueModifications => "allowEncryptedValueModifications",
            OptionFlag::CheckConstraints => "checkConstraints",
            OptionFlag::FireTriggers => "fireTriggers",
            OptionFlag::KeepIdentity => "keepIdentity",
            OptionFlag::KeepNulls => "keepNulls",
            OptionFlag::TableLock => "tableLock",
        }
    }

    /// Look up a flag by property name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Hint keyword sent with the bulk load, if the flag maps to one.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            OptionFlag::CheckConstraints => Some("CHECK_CONSTRAINTS"),
            OptionFlag::FireTriggers => Some("FIRE_TRIGGERS"),
            OptionFlag::KeepIdentity => Some("KEEPIDENTITY"),
            OptionFlag::KeepNulls => Some("KEEP_NULLS"),
            OptionFlag::TableLock => Some("TABLOCK"),
            OptionFlag::UseInternalTransaction | OptionFlag::AllowEncryptedValueModifications => {
                None
            }
        }
    }
}

impl BulkCopyOptions {
    pub fn get(&self, flag: OptionFlag) -> bool {
        match flag {
            OptionFlag::UseInternalTransaction => self.use_internal_transaction,
            OptionFlag::AllowEncryptedValueModifications => {
                self.allow_encrypted_value_modifications
            }
            OptionFlag::CheckConstraints => self.check_constraints,
            OptionFlag::FireTriggers => self.fire_triggers,
            OptionFlag::KeepIdentity => self.keep_identity,
            OptionFlag::KeepNulls => self.keep_nulls,
            OptionFlag::TableLock => self.table_lock,
        }
    }

    pub fn set(&mut self, flag: OptionFlag, on: bool) {
        let slot = match flag {
            OptionFlag::UseInternalTransaction => &mut self.use_internal_transaction,
            OptionFlag::AllowEncryptedValueModifications => {
                &mut self.allow_encrypted_value_modifications
            }
            OptionFlag::CheckConstraints => &mut self.check_constraints,
            OptionFlag::FireTriggers => &mut self.fire_triggers,
            OptionFlag::KeepIdentity => &mut self.keep_identity,
            OptionFlag::KeepNulls => &mut self.keep_nulls,
            OptionFlag::TableLock => &mut self.table_lock,
        };
        *slot = on;
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, flag: OptionFlag, on: bool) -> Self {
        self.set(flag, on);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.bulk_copy_timeout_secs = secs;
        self
    }

    /// Flags that are switched on.
    pub fn enabled(&self) -> Vec<OptionFlag> {
        OptionFlag::ALL
            .into_iter()
            .filter(|f| self.get(*f))
            .collect()
    }

    /// Bulk load hints for the enabled flags, e.g. `TABLOCK, KEEP_NULLS`.
    pub fn hints(&self) -> Vec<&'static str> {
        self.enabled().into_iter().filter_map(OptionFlag::hint).collect()
    }
}

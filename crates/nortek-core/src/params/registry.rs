//! Ordered parameter table plus the current value of every parameter.
//!
//! The registry is the only place that knows how the user configuration
//! block is laid out.  It decodes a freshly read block into values, builds a
//! block from the current values for a `CC` write, and tells the caller
//! whether a read changed anything.
//!
//! Updates are all-or-nothing: a block is checksum-validated and fully
//! decoded into a temporary list before any value is replaced.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info};

use super::{Parameter, RegistryError, Value, Visibility};
use crate::protocol::codec::{seal_checksum, WORD_LEN};
use crate::protocol::frames::{validate_block, FrameSpec, USER_CONFIG};

/// Snapshot of parameter values keyed by name.
pub type ConfigSnapshot = BTreeMap<String, Value>;

/// Emitted when a block read changes the visible configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub old: ConfigSnapshot,
    pub new: ConfigSnapshot,
}

impl ConfigChange {
    /// Names whose value was added, removed, or changed.
    pub fn changed_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .new
            .iter()
            .filter(|(name, value)| self.old.get(*name) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect();
        names.extend(
            self.old
                .keys()
                .filter(|name| !self.new.contains_key(*name))
                .map(String::as_str),
        );
        names
    }
}

#[derive(Debug, Clone)]
struct Entry {
    param: Parameter,
    value: Option<Value>,
}

/// Ordered mapping name → [`Parameter`] plus current [`Value`].
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    block: FrameSpec,
    seed: u16,
    sealed: bool,
    last_block: Option<Vec<u8>>,
}

impl ParameterRegistry {
    /// Empty registry for the user configuration block, checksummed with `seed`.
    pub fn new(seed: u16) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            block: USER_CONFIG,
            seed,
            sealed: false,
            last_block: None,
        }
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    /// Registers a parameter.  Its current value starts as its default.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] once live traffic has started and
    /// [`RegistryError::Duplicate`] for a name already registered.
    pub fn add_parameter(&mut self, param: Parameter) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed(param.name));
        }
        if self.index.contains_key(&param.name) {
            return Err(RegistryError::Duplicate(param.name));
        }
        self.index.insert(param.name.clone(), self.entries.len());
        let value = param.default_value.clone();
        self.entries.push(Entry { param, value });
        Ok(())
    }

    /// Closes the registry to further [`ParameterRegistry::add_parameter`] calls.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Records a pre-contact seed value.
    ///
    /// Parameters that live only in the driver take the value immediately;
    /// block parameters keep it until the startup step writes it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownParameter`] or a type-check failure.
    pub fn set_init_value(&mut self, name: &str, value: Value) -> Result<(), RegistryError> {
        let entry = self.entry_mut(name)?;
        entry.param.check(&value)?;
        if entry.param.span.is_none() {
            entry.value = Some(value.clone());
        }
        entry.param.init_value = Some(value);
        Ok(())
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    fn entry(&self, name: &str) -> Result<&Entry, RegistryError> {
        self.index
            .get(name)
            .map(|i| &self.entries[*i])
            .ok_or_else(|| RegistryError::UnknownParameter(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut Entry, RegistryError> {
        match self.index.get(name) {
            Some(i) => Ok(&mut self.entries[*i]),
            None => Err(RegistryError::UnknownParameter(name.to_string())),
        }
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownParameter`] for an unregistered name.
    pub fn parameter(&self, name: &str) -> Result<&Parameter, RegistryError> {
        Ok(&self.entry(name)?.param)
    }

    /// Parameters in registration order.
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter().map(|e| &e.param)
    }

    /// Current value, `None` until read from the instrument or defaulted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownParameter`] for an unregistered name.
    pub fn value(&self, name: &str) -> Result<Option<&Value>, RegistryError> {
        Ok(self.entry(name)?.value.as_ref())
    }

    /// Every non-spare parameter that has a value.
    pub fn get_config(&self) -> ConfigSnapshot {
        self.entries
            .iter()
            .filter(|e| !e.param.is_spare())
            .filter_map(|e| Some((e.param.name.clone(), e.value.clone()?)))
            .collect()
    }

    /// Values for the requested names; unset parameters are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownParameter`] on the first unknown name.
    pub fn get(&self, names: &[&str]) -> Result<ConfigSnapshot, RegistryError> {
        let mut out = ConfigSnapshot::new();
        for name in names {
            if let Some(value) = &self.entry(name)?.value {
                out.insert(name.to_string(), value.clone());
            }
        }
        Ok(out)
    }

    // ── Local sets ────────────────────────────────────────────────────────────

    /// Stages a caller-supplied value.  Nothing is written to the instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ReadOnly`] or [`RegistryError::Immutable`]
    /// before looking at `value`, then any type or range failure.
    pub fn set_from_value(&mut self, name: &str, value: Value) -> Result<(), RegistryError> {
        let entry = self.entry_mut(name)?;
        match entry.param.visibility {
            Visibility::ReadOnly => return Err(RegistryError::ReadOnly(name.to_string())),
            Visibility::Immutable => return Err(RegistryError::Immutable(name.to_string())),
            Visibility::ReadWrite => {}
        }
        entry.param.check(&value)?;
        entry.value = Some(value);
        Ok(())
    }

    /// Stages a startup value, which may target read-only parameters.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Immutable`] or a type-check failure.
    pub fn stage_startup(&mut self, name: &str, value: Value) -> Result<(), RegistryError> {
        let entry = self.entry_mut(name)?;
        if entry.param.visibility == Visibility::Immutable {
            return Err(RegistryError::Immutable(name.to_string()));
        }
        entry.param.check(&value)?;
        entry.value = Some(value);
        Ok(())
    }

    /// Startup block parameters whose init value differs from the current value.
    pub fn pending_startup_values(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .filter(|e| e.param.startup_param && e.param.span.is_some())
            .filter(|e| e.param.visibility != Visibility::Immutable)
            .filter_map(|e| {
                let init = e.param.init_value.as_ref()?;
                (e.value.as_ref() != Some(init)).then(|| (e.param.name.clone(), init.clone()))
            })
            .collect()
    }

    // ── Wire format ───────────────────────────────────────────────────────────

    /// Current value of `name` fitted to its field width.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownParameter`], [`RegistryError::NoValue`],
    /// or an encode failure.
    pub fn format_for_wire(&self, name: &str) -> Result<Vec<u8>, RegistryError> {
        let entry = self.entry(name)?;
        let value = entry.value.as_ref().ok_or_else(|| RegistryError::NoValue {
            name: name.to_string(),
        })?;
        entry.param.encode_fitted(value)
    }

    /// Builds a complete, checksummed user configuration block.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LayoutGap`] if the block fields do not tile
    /// the block, or any [`ParameterRegistry::format_for_wire`] failure.
    pub fn build_configuration_block(&self) -> Result<Vec<u8>, RegistryError> {
        let mut fields: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| e.param.span.is_some())
            .collect();
        fields.sort_by_key(|e| e.param.span.map(|s| s.offset));

        let mut block = Vec::with_capacity(self.block.length);
        block.extend_from_slice(self.block.sync);
        for entry in fields {
            let offset = entry.param.span.map_or(0, |s| s.offset);
            if offset != block.len() {
                return Err(RegistryError::LayoutGap {
                    name: entry.param.name.clone(),
                    offset,
                    expected: block.len(),
                });
            }
            block.extend(self.format_for_wire(&entry.param.name)?);
        }

        let checksum_at = self.block.length - WORD_LEN;
        if block.len() != checksum_at {
            return Err(RegistryError::LayoutGap {
                name: "checksum".to_string(),
                offset: block.len(),
                expected: checksum_at,
            });
        }
        block.extend_from_slice(&[0, 0]);
        seal_checksum(&mut block, self.seed).map_err(|source| RegistryError::Codec {
            name: "checksum".to_string(),
            source,
        })?;
        Ok(block)
    }

    /// Replaces every block parameter from a validated block.
    ///
    /// `bytes` may carry a trailing ACK.  Returns the change if the visible
    /// snapshot differs from before.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBlock`] for a bad length, sync, or
    /// checksum, and [`RegistryError::Codec`] if a field fails to decode.  In
    /// both cases no value is modified.
    pub fn update_from_block(&mut self, bytes: &[u8]) -> Result<Option<ConfigChange>, RegistryError> {
        let block = validate_block(bytes, &self.block, self.seed)?;

        let mut decoded = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let Some(span) = entry.param.span else {
                continue;
            };
            let field = block.get(span.offset..span.end()).unwrap_or_default();
            let value = entry
                .param
                .decode(field)
                .map_err(|source| RegistryError::Codec {
                    name: entry.param.name.clone(),
                    source,
                })?;
            decoded.push((i, value));
        }

        let old = self.get_config();
        for (i, value) in decoded {
            self.entries[i].value = Some(value);
        }
        self.last_block = Some(block.to_vec());
        let new = self.get_config();

        if old == new {
            debug!("configuration block read, no change");
            return Ok(None);
        }
        let change = ConfigChange { old, new };
        info!(changed = ?change.changed_names(), "configuration changed");
        Ok(Some(change))
    }

    // ── Raw import / export ───────────────────────────────────────────────────

    /// The last validated block, ACK stripped.
    pub fn last_block(&self) -> Option<&[u8]> {
        self.last_block.as_deref()
    }

    /// The last validated block as base64.
    pub fn export_raw_config(&self) -> Option<String> {
        self.last_block.as_ref().map(|b| STANDARD.encode(b))
    }

    /// Loads a base64 block (with or without a trailing ACK) as if it had
    /// just been read from the instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBlob`] for bad base64, otherwise the
    /// same failures as [`ParameterRegistry::update_from_block`].
    pub fn import_raw_config(&mut self, blob: &str) -> Result<Option<ConfigChange>, RegistryError> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|e| RegistryError::InvalidBlob(e.to_string()))?;
        self.update_from_block(&bytes)
    }
}

// # Property Twin
//
// Pure state machine for one (device, property). No I/O: the reconciler
// task feeds it collected values and write outcomes and asks it what to do
// next. Values are stored in canonical form, so "desired == reported" is
// plain string equality.

use super::{PropertyStatus, TwinProperty, TwinState, TwinValue};
use crate::error::{Error, Result};
use crate::model::PropertyDefinition;

#[derive(Debug, Clone)]
pub struct PropertyTwin {
    definition: PropertyDefinition,
    twin: TwinProperty,
    state: TwinState,
    pending_write: bool,
    cause: Option<String>,
}

impl PropertyTwin {
    pub fn new(definition: PropertyDefinition) -> Self {
        Self {
            definition,
            twin: TwinProperty::default(),
            state: TwinState::Unset,
            pending_write: false,
            cause: None,
        }
    }

    pub fn definition(&self) -> &PropertyDefinition {
        &self.definition
    }

    pub fn twin(&self) -> &TwinProperty {
        &self.twin
    }

    pub fn state(&self) -> TwinState {
        self.state
    }

    pub fn status(&self) -> PropertyStatus {
        PropertyStatus {
            state: self.state,
            cause: self.cause.clone(),
            pending_write: self.pending_write,
        }
    }

    /// Accept a desired value
    ///
    /// Fails with `Error::Config` for read-only properties and for values
    /// that do not parse or fall outside the declared range. On failure the
    /// twin is left untouched.
    ///
    /// Returns the canonical form that was stored.
    pub fn set_desired(&mut self, raw: &str) -> Result<String> {
        if !self.definition.is_writable() {
            return Err(Error::config(format!(
                "property '{}' is read-only",
                self.definition.name
            )));
        }
        let canonical = self.definition.canonicalize(raw)?;

        self.twin.desired = Some(TwinValue::now(
            canonical.clone(),
            self.definition.semantic_type,
        ));
        self.pending_write = false;
        if self.state != TwinState::Degraded {
            self.state = TwinState::Desired;
        }
        Ok(canonical)
    }

    /// Record a collected value (canonical form) and return the new state
    pub fn record_reported(&mut self, canonical: String) -> TwinState {
        self.twin.reported = Some(TwinValue::now(canonical, self.definition.semantic_type));
        self.pending_write = false;
        self.cause = None;
        self.state = if self.in_sync() {
            TwinState::Synced
        } else {
            TwinState::Reported
        };
        self.state
    }

    /// The desired value to write, if convergence requires a write now
    pub fn pending_desired(&self) -> Option<String> {
        if !self.definition.is_writable()
            || self.state != TwinState::Reported
            || self.pending_write
        {
            return None;
        }
        let desired = self.twin.desired.as_ref()?;
        (!self.in_sync()).then(|| desired.value.clone())
    }

    /// A write of the desired value succeeded; confirmation comes with the
    /// next collection
    pub fn write_succeeded(&mut self) {
        self.pending_write = true;
    }

    pub fn degrade(&mut self, cause: impl Into<String>) {
        self.state = TwinState::Degraded;
        self.pending_write = false;
        self.cause = Some(cause.into());
    }

    fn in_sync(&self) -> bool {
        match (&self.twin.desired, &self.twin.reported) {
            (Some(desired), Some(reported)) => desired.value == reported.value,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessMode, SemanticType};

    fn setpoint() -> PropertyTwin {
        PropertyTwin::new(
            PropertyDefinition::new("setpoint", SemanticType::Double)
                .with_range(Some(0.0), Some(100.0)),
        )
    }

    #[test]
    fn test_converges_after_write() {
        let mut twin = setpoint();
        assert_eq!(twin.state(), TwinState::Unset);

        assert_eq!(twin.set_desired("21.50").unwrap(), "21.5");
        assert_eq!(twin.state(), TwinState::Desired);
        assert!(twin.pending_desired().is_none());

        assert_eq!(twin.record_reported("19".to_string()), TwinState::Reported);
        assert_eq!(twin.pending_desired().as_deref(), Some("21.5"));

        twin.write_succeeded();
        assert!(twin.pending_desired().is_none());
        assert!(twin.status().pending_write);

        assert_eq!(twin.record_reported("21.5".to_string()), TwinState::Synced);
        assert!(!twin.status().pending_write);
    }

    #[test]
    fn test_read_only_rejects_desired() {
        let mut twin = PropertyTwin::new(
            PropertyDefinition::new("temperature", SemanticType::Double)
                .with_access_mode(AccessMode::ReadOnly),
        );
        assert!(twin.set_desired("20").unwrap_err().is_config());
        assert!(twin.twin().desired.is_none());

        twin.record_reported("18".to_string());
        assert!(twin.pending_desired().is_none());
    }

    #[test]
    fn test_invalid_desired_leaves_twin_untouched() {
        let mut twin = setpoint();
        twin.set_desired("50").unwrap();
        assert!(twin.set_desired("150").unwrap_err().is_config());
        assert_eq!(twin.twin().desired.as_ref().unwrap().value, "50");
    }

    #[test]
    fn test_degraded_recovers_on_collection() {
        let mut twin = setpoint();
        twin.degrade("read timed out");
        assert_eq!(twin.status().cause.as_deref(), Some("read timed out"));

        // A new desired value does not hide the degradation
        twin.set_desired("10").unwrap();
        assert_eq!(twin.state(), TwinState::Degraded);

        assert_eq!(twin.record_reported("10".to_string()), TwinState::Synced);
        assert!(twin.status().cause.is_none());
    }
}

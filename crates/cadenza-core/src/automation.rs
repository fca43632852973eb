//! Cross-domain automation value targets.
//!
//! The automation engine evaluates lanes and pushes one of these bundles per
//! track; the receiving node smooths each present field toward its target.

/// Raw targets for one push. Absent fields leave the parameter untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AutomationValues {
    pub volume: Option<f32>,
    pub pan: Option<f32>,
    pub eq_low_db: Option<f32>,
    pub eq_mid_db: Option<f32>,
    pub eq_high_db: Option<f32>,
}

impl AutomationValues {
    pub fn is_empty(&self) -> bool {
        self.volume.is_none()
            && self.pan.is_none()
            && self.eq_low_db.is_none()
            && self.eq_mid_db.is_none()
            && self.eq_high_db.is_none()
    }
}

/// Receiver side of the automation path, implemented by track handles.
/// `apply` is the periodic smoothed push; `prime` initialises smoothed state
/// at transport start so playback begins at the start-beat value.
pub trait AutomationTarget: Send + Sync {
    fn apply(&self, values: &AutomationValues);
    fn prime(&self, values: &AutomationValues);
}

use std::sync::RwLock;
use rustc_hash::FxHashMap;
use tracing::info;


/// How the receive side treats NORMAL messages, configured per user tag for shedding load
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptMode {
    /// deliver the message and acknowledge it
    Accept,
    /// do not deliver the message, and let the sender know with a NACK
    Reject,
    /// ignore the message without responding, so the sender retransmits and a retransmission
    ///  may be accepted later
    Drop,
}

struct AdmissionState {
    default_mode: AcceptMode,
    overrides: FxHashMap<String, AcceptMode>,
}

/// Admission control holds a default [AcceptMode] and per-tag overrides. It lives as long as the
///  messaging service, i.e. it survives re-initialization with a new configuration.
pub struct AdmissionControl {
    state: RwLock<AdmissionState>,
}

impl Default for AdmissionControl {
    fn default() -> Self {
        AdmissionControl {
            state: RwLock::new(AdmissionState {
                default_mode: AcceptMode::Accept,
                overrides: Default::default(),
            }),
        }
    }
}

impl AdmissionControl {
    /// Without tags, this sets the default mode and removes all per-tag overrides. With tags, it
    ///  sets an override for each of them, leaving the default untouched.
    pub fn set_accept_mode(&self, mode: AcceptMode, tags: &[&str]) {
        let mut state = self.state.write().unwrap();
        if tags.is_empty() {
            info!("setting default accept mode to {:?}", mode);
            state.default_mode = mode;
            state.overrides.clear();
        }
        else {
            info!("setting accept mode to {:?} for tags {:?}", mode, tags);
            for tag in tags {
                state.overrides.insert(tag.to_string(), mode);
            }
        }
    }

    pub fn mode_for(&self, user_tag: Option<&str>) -> AcceptMode {
        let state = self.state.read().unwrap();
        user_tag
            .and_then(|tag| state.overrides.get(tag))
            .copied()
            .unwrap_or(state.default_mode)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_accept() {
        let admission = AdmissionControl::default();
        assert_eq!(admission.mode_for(None), AcceptMode::Accept);
        assert_eq!(admission.mode_for(Some("T")), AcceptMode::Accept);
    }

    #[rstest]
    #[case::tagged(Some("T"), AcceptMode::Reject)]
    #[case::other_tag(Some("U"), AcceptMode::Drop)]
    #[case::untagged(None, AcceptMode::Drop)]
    fn test_override(#[case] tag: Option<&str>, #[case] expected: AcceptMode) {
        let admission = AdmissionControl::default();
        admission.set_accept_mode(AcceptMode::Drop, &[]);
        admission.set_accept_mode(AcceptMode::Reject, &["T", "V"]);
        assert_eq!(admission.mode_for(tag), expected);
    }

    #[test]
    fn test_setting_default_clears_overrides() {
        let admission = AdmissionControl::default();
        admission.set_accept_mode(AcceptMode::Reject, &["T"]);
        admission.set_accept_mode(AcceptMode::Drop, &[]);
        assert_eq!(admission.mode_for(Some("T")), AcceptMode::Drop);

        admission.set_accept_mode(AcceptMode::Accept, &[]);
        assert_eq!(admission.mode_for(Some("T")), AcceptMode::Accept);
    }
}

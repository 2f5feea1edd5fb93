//! Call variants and capability computation
//!
//! Capabilities are recomputed from scratch on every state, address or
//! connection change by a pure pipeline:
//!
//! `base → apply_video → apply_audio_quality → apply_conference_termination → apply_voice_privacy`
//!
//! Variant-specific behavior comes from the [`CapabilityProvider`] trait.

use serde::{Deserialize, Serialize};
use tel_protocol::{
    AudioQuality, Capabilities, ConnectionSnapshot, FacadeState, LineFamily, VideoCapability,
};

/// Per-variant behavior of a facade call
pub trait CapabilityProvider {
    /// Capabilities every call of this variant has in `state`
    fn base_capabilities(&self, state: FacadeState) -> Capabilities;

    /// Whether hold and unhold can be requested at all
    fn supports_hold(&self) -> bool;

    /// Bits a conference participant of this variant gets
    fn conference_termination(&self) -> Capabilities;

    /// Whether the radio's voice-privacy flag is surfaced
    fn reports_voice_privacy(&self) -> bool;
}

/// The two families of facade call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallVariant {
    /// Full hold and conference support
    #[default]
    Standard,
    /// No hold; conference legs cannot be split or dropped individually
    LegacyCircuit,
}

impl From<LineFamily> for CallVariant {
    fn from(family: LineFamily) -> Self {
        match family {
            LineFamily::Standard => CallVariant::Standard,
            LineFamily::LegacyCircuit => CallVariant::LegacyCircuit,
        }
    }
}

impl CapabilityProvider for CallVariant {
    fn base_capabilities(&self, state: FacadeState) -> Capabilities {
        if state.is_terminal() {
            return Capabilities::NONE;
        }

        let mut caps = Capabilities::MUTE;
        caps.set(Capabilities::RESPOND_VIA_TEXT, state == FacadeState::Ringing);
        if self.supports_hold() {
            caps |= Capabilities::SUPPORT_HOLD;
            caps.set(
                Capabilities::HOLD,
                matches!(state, FacadeState::Active | FacadeState::Holding),
            );
        }
        caps
    }

    fn supports_hold(&self) -> bool {
        matches!(self, CallVariant::Standard)
    }

    fn conference_termination(&self) -> Capabilities {
        match self {
            CallVariant::Standard => {
                Capabilities::DISCONNECT_FROM_CONFERENCE | Capabilities::SEPARATE_FROM_CONFERENCE
            }
            CallVariant::LegacyCircuit => Capabilities::NONE,
        }
    }

    fn reports_voice_privacy(&self) -> bool {
        matches!(self, CallVariant::LegacyCircuit)
    }
}

/// Everything the pipeline reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInputs {
    pub state: FacadeState,
    pub local_video: VideoCapability,
    pub remote_video: VideoCapability,
    pub audio_quality: AudioQuality,
    /// The call is a conference participant
    pub in_conference: bool,
    pub voice_privacy: bool,
}

impl CapabilityInputs {
    /// Inputs for a call in `state` backed by `connection`
    pub fn from_connection(state: FacadeState, connection: &ConnectionSnapshot) -> Self {
        Self {
            state,
            local_video: connection.local_video,
            remote_video: connection.remote_video,
            audio_quality: connection.audio_quality,
            in_conference: false,
            voice_privacy: connection.voice_privacy,
        }
    }

    /// Inputs for a call without a connection
    pub fn bare(state: FacadeState) -> Self {
        Self {
            state,
            local_video: VideoCapability::NONE,
            remote_video: VideoCapability::NONE,
            audio_quality: AudioQuality::Standard,
            in_conference: false,
            voice_privacy: false,
        }
    }
}

/// Run the whole pipeline
pub fn compute_capabilities(
    provider: &impl CapabilityProvider,
    inputs: &CapabilityInputs,
) -> Capabilities {
    let caps = provider.base_capabilities(inputs.state);
    if caps.is_empty() {
        return caps;
    }
    let caps = apply_video(caps, inputs.local_video, inputs.remote_video);
    let caps = apply_audio_quality(caps, inputs.audio_quality);
    let caps = apply_conference_termination(caps, provider, inputs.in_conference);
    apply_voice_privacy(caps, provider, inputs.voice_privacy)
}

pub fn apply_video(
    caps: Capabilities,
    local: VideoCapability,
    remote: VideoCapability,
) -> Capabilities {
    caps.with(Capabilities::VIDEO_LOCAL_RX, local.receive)
        .with(Capabilities::VIDEO_LOCAL_TX, local.transmit)
        .with(Capabilities::VIDEO_REMOTE_RX, remote.receive)
        .with(Capabilities::VIDEO_REMOTE_TX, remote.transmit)
}

pub fn apply_audio_quality(caps: Capabilities, quality: AudioQuality) -> Capabilities {
    caps.with(
        Capabilities::HIGH_DEF_AUDIO,
        quality == AudioQuality::HighDefinition,
    )
}

pub fn apply_conference_termination(
    caps: Capabilities,
    provider: &impl CapabilityProvider,
    in_conference: bool,
) -> Capabilities {
    let caps = caps
        .with(Capabilities::DISCONNECT_FROM_CONFERENCE, false)
        .with(Capabilities::SEPARATE_FROM_CONFERENCE, false);
    if in_conference {
        caps | provider.conference_termination()
    } else {
        caps
    }
}

pub fn apply_voice_privacy(
    caps: Capabilities,
    provider: &impl CapabilityProvider,
    voice_privacy: bool,
) -> Capabilities {
    caps.with(
        Capabilities::VOICE_PRIVACY,
        provider.reports_voice_privacy() && voice_privacy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_base() {
        let caps = CallVariant::Standard.base_capabilities(FacadeState::Active);
        assert!(caps.contains(Capabilities::HOLD | Capabilities::SUPPORT_HOLD | Capabilities::MUTE));

        let ringing = CallVariant::Standard.base_capabilities(FacadeState::Ringing);
        assert!(ringing.contains(Capabilities::RESPOND_VIA_TEXT));
        assert!(!ringing.contains(Capabilities::HOLD));

        assert!(CallVariant::Standard
            .base_capabilities(FacadeState::Destroyed)
            .is_empty());
    }

    #[test]
    fn test_legacy_has_no_hold() {
        let caps = CallVariant::LegacyCircuit.base_capabilities(FacadeState::Active);
        assert!(!caps.contains(Capabilities::HOLD));
        assert!(!caps.contains(Capabilities::SUPPORT_HOLD));
        assert!(!CallVariant::LegacyCircuit.supports_hold());
    }

    #[test]
    fn test_pipeline() {
        let inputs = CapabilityInputs {
            state: FacadeState::Active,
            local_video: VideoCapability::BIDIRECTIONAL,
            remote_video: VideoCapability {
                receive: true,
                transmit: false,
            },
            audio_quality: AudioQuality::HighDefinition,
            in_conference: true,
            voice_privacy: true,
        };

        let standard = compute_capabilities(&CallVariant::Standard, &inputs);
        assert!(standard.contains(Capabilities::VIDEO_LOCAL_TX | Capabilities::VIDEO_REMOTE_RX));
        assert!(!standard.contains(Capabilities::VIDEO_REMOTE_TX));
        assert!(standard.contains(Capabilities::HIGH_DEF_AUDIO));
        assert!(standard.contains(Capabilities::SEPARATE_FROM_CONFERENCE));
        assert!(!standard.contains(Capabilities::VOICE_PRIVACY));

        let legacy = compute_capabilities(&CallVariant::LegacyCircuit, &inputs);
        assert!(!legacy.contains(Capabilities::SEPARATE_FROM_CONFERENCE));
        assert!(legacy.contains(Capabilities::VOICE_PRIVACY));
    }

    #[test]
    fn test_leaving_conference_clears_termination_bits() {
        let caps = Capabilities::MUTE | Capabilities::DISCONNECT_FROM_CONFERENCE;
        let caps = apply_conference_termination(caps, &CallVariant::Standard, false);
        assert_eq!(caps, Capabilities::MUTE);
    }
}

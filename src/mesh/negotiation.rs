use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Where a peer stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
pub enum NegotiationState {
    #[default]
    Idle,
    /// A local offer was sent and no answer arrived yet.
    OfferSent,
    /// A remote offer was applied and the answer is being produced.
    AnswerPending,
    Stable,
}

impl NegotiationState {
    pub fn is_making_offer(&self) -> bool {
        *self == NegotiationState::OfferSent
    }
}

/// The participant with the higher identity yields on offer collisions.
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferDecision {
    /// Apply the offer. A pending local offer is dropped first when `discard_local_offer` is set.
    Accept { discard_local_offer: bool },
    Ignore,
}

pub(crate) fn offer_collision(state: NegotiationState, signaling: RTCSignalingState) -> bool {
    state.is_making_offer() || signaling != RTCSignalingState::Stable
}

pub(crate) fn decide_on_offer(
    polite: bool,
    state: NegotiationState,
    signaling: RTCSignalingState,
) -> OfferDecision {
    let collision = offer_collision(state, signaling);
    if collision && !polite {
        return OfferDecision::Ignore;
    }
    OfferDecision::Accept {
        discard_local_offer: collision && signaling == RTCSignalingState::HaveLocalOffer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_polite_side() {
        assert!(is_polite("bob", "alice"));
        assert!(!is_polite("alice", "bob"));
    }

    #[test]
    fn test_decide_on_offer() {
        assert_eq!(
            decide_on_offer(false, NegotiationState::Stable, RTCSignalingState::Stable),
            OfferDecision::Accept { discard_local_offer: false }
        );
        assert_eq!(
            decide_on_offer(
                false,
                NegotiationState::OfferSent,
                RTCSignalingState::HaveLocalOffer
            ),
            OfferDecision::Ignore
        );
        assert_eq!(
            decide_on_offer(
                true,
                NegotiationState::OfferSent,
                RTCSignalingState::HaveLocalOffer
            ),
            OfferDecision::Accept { discard_local_offer: true }
        );
        assert_eq!(
            decide_on_offer(true, NegotiationState::Idle, RTCSignalingState::Stable),
            OfferDecision::Accept { discard_local_offer: false }
        );
    }

    proptest! {
        #[test]
        fn test_exactly_one_side_is_polite(a in "[a-z0-9]{1,12}", b in "[a-z0-9]{1,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(is_polite(&a, &b), is_polite(&b, &a));
        }

        #[test]
        fn test_glare_has_one_winner(a in "[a-z0-9]{1,12}", b in "[a-z0-9]{1,12}") {
            prop_assume!(a != b);
            let a_decision = decide_on_offer(is_polite(&a, &b), NegotiationState::OfferSent, RTCSignalingState::HaveLocalOffer);
            let b_decision = decide_on_offer(is_polite(&b, &a), NegotiationState::OfferSent, RTCSignalingState::HaveLocalOffer);
            let ignored = [a_decision, b_decision].iter().filter(|d| **d == OfferDecision::Ignore).count();
            prop_assert_eq!(ignored, 1);
        }
    }
}

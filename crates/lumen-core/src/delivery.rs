use std::time::Duration;

use crate::cancellation::TurnToken;

/// Replayable view of a complete response as it would appear after each
/// token. Boundaries are single spaces so the joined result reproduces the
/// original text exactly.
#[derive(Debug, Clone)]
pub struct IncrementalDelivery<'a> {
    tokens: Vec<&'a str>,
}

impl<'a> IncrementalDelivery<'a> {
    pub fn new(full_text: &'a str) -> Self {
        Self {
            tokens: full_text.split(' ').collect(),
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// The partial text after `delivered` tokens.
    pub fn partial(&self, delivered: usize) -> String {
        let end = delivered.min(self.tokens.len());
        self.tokens[..end].join(" ")
    }

    pub fn frames(&self) -> impl Iterator<Item = String> + '_ {
        (1..=self.tokens.len()).map(move |n| self.partial(n))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed(String),
    Stopped { delivered: usize },
}

/// Plays the frames with `delay` between them, checking the token before
/// every increment.
pub async fn deliver<F>(
    full_text: &str,
    delay: Duration,
    token: &TurnToken,
    mut on_frame: F,
) -> DeliveryOutcome
where
    F: FnMut(String),
{
    let delivery = IncrementalDelivery::new(full_text);
    let mut delivered = 0;
    for frame in delivery.frames() {
        if token.is_revoked() {
            return DeliveryOutcome::Stopped { delivered };
        }
        on_frame(frame);
        delivered += 1;
        if delivered < delivery.token_count() && !delay.is_zero() {
            tokio::select! {
                _ = token.revoked() => return DeliveryOutcome::Stopped { delivered },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    if token.is_revoked() {
        return DeliveryOutcome::Stopped { delivered };
    }
    DeliveryOutcome::Completed(delivery.partial(delivered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_grow_one_token_at_a_time() {
        let delivery = IncrementalDelivery::new("BloodHound, PowerView, ADRecon");
        let frames = delivery.frames().collect::<Vec<_>>();
        assert_eq!(
            frames,
            vec![
                "BloodHound,".to_string(),
                "BloodHound, PowerView,".to_string(),
                "BloodHound, PowerView, ADRecon".to_string(),
            ]
        );
    }

    #[test]
    fn replay_is_deterministic_and_lossless_for_repeated_spaces() {
        let text = "a  b\nc ";
        let delivery = IncrementalDelivery::new(text);
        assert_eq!(delivery.partial(delivery.token_count()), text);
        assert_eq!(delivery.partial(2), IncrementalDelivery::new(text).partial(2));
        assert_eq!(delivery.partial(0), "");
        assert_eq!(delivery.partial(99), text);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_completes_with_full_text() {
        let token = TurnToken::new("req-1");
        let mut frames = Vec::new();
        let outcome = deliver("one two three", Duration::from_millis(30), &token, |f| {
            frames.push(f)
        })
        .await;
        assert_eq!(outcome, DeliveryOutcome::Completed("one two three".to_string()));
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_stops_at_next_check_point_when_revoked() {
        let token = TurnToken::new("req-1");
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            stopper.revoke();
        });
        let mut frames = Vec::new();
        let outcome = deliver("a b c d e f", Duration::from_millis(30), &token, |f| {
            frames.push(f)
        })
        .await;
        assert_eq!(outcome, DeliveryOutcome::Stopped { delivered: 2 });
        assert_eq!(frames, vec!["a".to_string(), "a b".to_string()]);
    }

    #[tokio::test]
    async fn already_revoked_token_delivers_nothing() {
        let token = TurnToken::new("req-1");
        token.revoke();
        let outcome = deliver("x y", Duration::ZERO, &token, |_| {}).await;
        assert_eq!(outcome, DeliveryOutcome::Stopped { delivered: 0 });
    }
}

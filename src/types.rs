use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub label: Sentiment,
    pub confidence: f64,
}

/// Output classes, in the order of the model's logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Neg,
    Pos,
    Neu,
}

impl Sentiment {
    pub const ORDER: [Sentiment; 3] = [Sentiment::Neg, Sentiment::Pos, Sentiment::Neu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Neg => "NEG",
            Sentiment::Pos => "POS",
            Sentiment::Neu => "NEU",
        }
    }
}

/// Softmax distribution over [`Sentiment::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentScores {
    probs: [f32; 3],
}

impl SentimentScores {
    pub fn from_slice(probs: &[f32]) -> Result<Self> {
        match probs {
            [neg, pos, neu] => Ok(Self {
                probs: [*neg, *pos, *neu],
            }),
            _ => bail!("Expected 3 class probabilities, got {}", probs.len()),
        }
    }

    pub fn probs(&self) -> [f32; 3] {
        self.probs
    }

    /// Most likely class and its probability. Ties go to the lower index.
    pub fn argmax(&self) -> (Sentiment, f32) {
        let mut best = 0;
        for (index, &p) in self.probs.iter().enumerate().skip(1) {
            if p > self.probs[best] {
                best = index;
            }
        }
        (Sentiment::ORDER[best], self.probs[best])
    }

    pub fn to_prediction(&self) -> PredictionResult {
        let (label, prob) = self.argmax();
        PredictionResult {
            label,
            confidence: round4(prob as f64),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_serialize_uppercase() {
        let result = PredictionResult {
            label: Sentiment::Neu,
            confidence: 0.5,
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"label": "NEU", "confidence": 0.5})
        );
        for sentiment in Sentiment::ORDER {
            assert_eq!(
                serde_json::to_value(sentiment).unwrap(),
                serde_json::Value::from(sentiment.as_str())
            );
        }
    }

    #[test]
    fn picks_highest_probability() {
        let scores = SentimentScores::from_slice(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(scores.argmax(), (Sentiment::Pos, 0.7));

        let scores = SentimentScores::from_slice(&[0.05, 0.15, 0.8]).unwrap();
        assert_eq!(scores.argmax().0, Sentiment::Neu);
    }

    #[test]
    fn ties_resolve_to_first_class() {
        let scores = SentimentScores::from_slice(&[0.4, 0.4, 0.2]).unwrap();
        assert_eq!(scores.argmax().0, Sentiment::Neg);

        let scores = SentimentScores::from_slice(&[0.2, 0.4, 0.4]).unwrap();
        assert_eq!(scores.argmax().0, Sentiment::Pos);
    }

    #[test]
    fn confidence_rounded_to_four_places() {
        let scores = SentimentScores::from_slice(&[0.012_345, 0.987_654_3, 0.000_000_7]).unwrap();
        let prediction = scores.to_prediction();
        assert_eq!(prediction.label, Sentiment::Pos);
        assert!((prediction.confidence - 0.9877).abs() < 1e-9);

        let scores = SentimentScores::from_slice(&[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(scores.to_prediction().confidence, 1.0);
    }

    #[test]
    fn rejects_wrong_class_count() {
        assert!(SentimentScores::from_slice(&[0.5, 0.5]).is_err());
        assert!(SentimentScores::from_slice(&[0.25; 4]).is_err());
    }

    #[test]
    fn request_requires_text() {
        assert!(serde_json::from_str::<TextRequest>(r#"{}"#).is_err());
        assert!(serde_json::from_str::<TextRequest>(r#"{"text": 1}"#).is_err());
        let request: TextRequest = serde_json::from_str(r#"{"text": ""}"#).unwrap();
        assert_eq!(request.text, "");
    }
}

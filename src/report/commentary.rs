use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CommentarySettings;
use crate::types::{RegimeLabel, Signal};

const SYSTEM_PROMPT: &str = "You are a professional quantitative analyst providing concise market commentary. \
Be direct, insightful, and focus on actionable insights. Keep responses under 200 words. Do not use emojis.";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// Market commentary for a signal.
///
/// Uses an OpenAI-compatible chat endpoint (Groq by default) when an API key
/// is configured and falls back to rule-based text otherwise or on any failure.
pub struct CommentaryGenerator {
    client: Client,
    settings: CommentarySettings,
}

impl CommentaryGenerator {
    pub fn new(settings: CommentarySettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn uses_api(&self) -> bool {
        self.settings.enabled && self.settings.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub async fn generate(&self, signal: &Signal) -> String {
        if !self.uses_api() {
            return fallback_commentary(signal);
        }
        match self.request(signal).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("Commentary API returned an empty reply, using fallback");
                fallback_commentary(signal)
            }
            Err(e) => {
                warn!("Commentary API failed, using fallback: {}", e);
                fallback_commentary(signal)
            }
        }
    }

    async fn request(&self, signal: &Signal) -> Result<String, reqwest::Error> {
        let prompt = build_prompt(signal);
        let body = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.7,
            max_tokens: 300,
        };

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        debug!("Requesting commentary from {}", url);

        let response: ChatResponse = self
            .client
            .post(url)
            .bearer_auth(self.settings.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

fn build_prompt(signal: &Signal) -> String {
    let regime = signal.regime();
    let ensemble = signal.ensemble();
    let sizing = signal.sizing();

    let models: String = signal
        .predictions()
        .iter()
        .map(|m| {
            format!(
                "- {}: {} (Confidence: {:.1}%, out-of-sample accuracy {:.1}%)\n",
                m.model_id,
                m.direction,
                m.confidence * 100.0,
                m.historical_accuracy * 100.0
            )
        })
        .collect();

    format!(
        "Analyze the following quantitative signals for {} (Current Price: ${}):\n\n\
         MARKET REGIME:\n\
         - Current State: {}\n\
         - Regime Probabilities: LOW {:.3}, MED {:.3}, HIGH {:.3}\n\n\
         MODEL PREDICTIONS:\n{}\
         - Ensemble Direction: {} (win probability {:.1}%)\n\n\
         POSITION SIZING:\n\
         - Recommended Position: {:.2}% of portfolio\n\
         - Full Kelly: {:.2}%\n\n\
         Provide a brief, professional analysis covering:\n\
         1. What the regime detection suggests about current market conditions\n\
         2. Key takeaways from the model predictions\n\
         3. Risk considerations and recommended approach\n\n\
         Do not use emojis. Be concise and professional.\n",
        signal.ticker(),
        signal.price().round_dp(2),
        regime.label,
        regime.probabilities[0],
        regime.probabilities[1],
        regime.probabilities[2],
        models,
        ensemble.direction,
        ensemble.win_probability * 100.0,
        sizing.recommended * 100.0,
        sizing.full_kelly * 100.0,
    )
}

fn regime_insight(label: RegimeLabel) -> &'static str {
    match label {
        RegimeLabel::LowVol => "low volatility environment supports trend continuation",
        RegimeLabel::MedVol => "moderate volatility indicates a transitional market phase",
        RegimeLabel::HighVol => "high volatility environment suggests elevated risk",
    }
}

/// Deterministic commentary built only from the signal
pub fn fallback_commentary(signal: &Signal) -> String {
    let regime = signal.regime();
    let ensemble = signal.ensemble();
    let agreement = if signal.models_agree() { "Strong" } else { "Mixed" };

    format!(
        "AUTOMATED ANALYSIS SUMMARY: {}\n\n\
         The regime detector reports a {} state ({:.0}% probability): the {}.\n\n\
         The model ensemble shows a {} bias with {:.1}% confidence and an estimated win \
         probability of {:.1}%. The recommended position of {:.2}% of portfolio reflects model \
         confidence, the payoff ratio of {:.2} and a regime multiplier of {:.2}.\n\n\
         KEY CONSIDERATIONS:\n\
         - Regime-adjusted sizing provides risk management\n\
         - Model agreement: {} consensus between models\n\
         - Always use stop-losses and proper risk management\n\n\
         Note: This is an automated analysis. Consider additional fundamental and macro factors before trading.\n",
        signal.ticker(),
        regime.label,
        regime.confidence() * 100.0,
        regime_insight(regime.label),
        ensemble.direction.as_str().to_lowercase(),
        ensemble.confidence * 100.0,
        ensemble.win_probability * 100.0,
        signal.sizing().recommended * 100.0,
        signal.sizing().payoff_ratio,
        signal.sizing().regime_multiplier,
        agreement,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::sample_signal;

    #[test]
    fn test_fallback_reports_agreement() {
        let signal = sample_signal("AAPL", 0.085);
        let text = fallback_commentary(&signal);
        assert!(text.contains("AUTOMATED ANALYSIS SUMMARY: AAPL"));
        assert!(text.contains("LOW_VOL"));
        assert!(text.contains("supports trend continuation"));
        assert!(text.contains("Strong consensus"));
        assert!(text.contains("8.50% of portfolio"));
    }

    #[test]
    fn test_prompt_lists_every_model() {
        let signal = sample_signal("SPY", 0.02);
        let prompt = build_prompt(&signal);
        assert!(prompt.contains("gradient_boosting: LONG"));
        assert!(prompt.contains("elastic_net: LONG"));
        assert!(prompt.contains("$187.25"));
    }

    #[test]
    fn test_without_api_key_uses_fallback() {
        let generator = CommentaryGenerator::new(CommentarySettings::default()).unwrap();
        assert!(!generator.uses_api());

        let signal = sample_signal("MSFT", 0.01);
        let text = tokio_test::block_on(generator.generate(&signal));
        assert_eq!(text, fallback_commentary(&signal));
    }

    #[tokio::test]
    async fn test_unreachable_api_falls_back() {
        let settings = CommentarySettings {
            api_key: Some("test-key".to_string()),
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..CommentarySettings::default()
        };
        let generator = CommentaryGenerator::new(settings).unwrap();
        assert!(generator.uses_api());

        let signal = sample_signal("QQQ", 0.03);
        assert_eq!(generator.generate(&signal).await, fallback_commentary(&signal));
    }

    #[test]
    fn test_disabled_generator_ignores_key() {
        let settings = CommentarySettings {
            enabled: false,
            api_key: Some("test-key".to_string()),
            ..CommentarySettings::default()
        };
        assert!(!CommentaryGenerator::new(settings).unwrap().uses_api());
    }
}

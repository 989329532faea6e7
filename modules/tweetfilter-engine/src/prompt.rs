//! Rating request construction and response parsing.

use std::sync::LazyLock;

use ai_client::{CompletionRequest, ContentPart, Message};
use regex::Regex;

use tweetfilter_common::config::ModelConfig;
use tweetfilter_common::{Score, ScoreError};

const REVIEW_SYSTEM_PROMPT: &str = "You are a feed curator. You read one social media post \
together with the thread it belongs to and rate how worth reading the target post is, \
following the user's instructions below.

Rules:
- Rate only the post named in TARGET_TWEET_ID. Earlier posts are context.
- Media descriptions and media URLs belong to the post they follow.
- Your final score must appear exactly once as SCORE_X, where X is an integer from 0 to 10.
- Keep the analysis short and specific to the post.";

const RESPONSE_FORMAT: &str = "Follow this expected response format exactly:
EXPECTED_RESPONSE_FORMAT:
  <ANALYSIS>
    (Your analysis according to the user instructions.)
  </ANALYSIS>

  <SCORE>
    SCORE_X (Where X is a number between 0 and 10)
  </SCORE>

  <FOLLOW_UP_QUESTIONS>
    Q_1. ...
    Q_2. ...
    Q_3. ...
  </FOLLOW_UP_QUESTIONS>";

static SCORE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"SCORE_(\d+)").unwrap());

static ANALYSIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<ANALYSIS>(.*?)(?:</ANALYSIS>|$)").unwrap());

/// Build the rating request for one item.
pub fn build_request(
    model: &ModelConfig,
    instructions: &str,
    item_id: &str,
    context: &str,
    media_urls: &[String],
) -> CompletionRequest {
    let system = format!("{REVIEW_SYSTEM_PROMPT}\n\nUSER'S CUSTOM INSTRUCTIONS:\n{instructions}");
    let text = format!(
        "<TARGET_TWEET_ID>[{item_id}]</TARGET_TWEET_ID>\n\n<TWEET>[{context}]</TWEET>\n{RESPONSE_FORMAT}"
    );

    let user = if model.supports_images && !media_urls.is_empty() {
        let mut parts = vec![ContentPart::text(text)];
        parts.extend(media_urls.iter().map(ContentPart::image));
        Message::user_parts(parts)
    } else {
        Message::user(text)
    };

    let mut request = CompletionRequest::new(model.effective_model())
        .message(Message::system(system))
        .message(user)
        .temperature(model.temperature)
        .top_p(model.top_p);
    if let Some(max_tokens) = model.max_tokens {
        request = request.max_tokens(max_tokens);
    }
    if let Some(sort) = &model.provider_sort {
        request = request.provider_sort(sort.clone());
    }
    request
}

/// The last `SCORE_<n>` marker in the text.
pub fn extract_score(text: &str) -> Result<Score, ScoreError> {
    let digits = SCORE_MARKER
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .ok_or(ScoreError::Missing)?
        .as_str();
    let value: u64 = digits
        .parse()
        .map_err(|_| ScoreError::Unparsable(digits.to_string()))?;
    Score::new(value)
}

/// Like [`extract_score`], but treats a missing or invalid marker as "not yet".
pub fn partial_score(text: &str) -> Option<Score> {
    extract_score(text).ok()
}

/// The analysis section, or the whole trimmed text when there is none.
pub fn extract_description(text: &str) -> String {
    ANALYSIS
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| text.trim().to_string())
}

/// Three follow-up questions marked `Q_1.`, `Q_2.`, `Q_3.`, in order and all
/// non-empty. Anything else yields no questions.
pub fn extract_follow_up_questions(text: &str) -> Vec<String> {
    let (Some(q1), Some(q2), Some(q3)) = (text.find("Q_1."), text.find("Q_2."), text.find("Q_3."))
    else {
        return Vec::new();
    };
    if !(q1 < q2 && q2 < q3) {
        return Vec::new();
    }

    let last = &text[q3 + 4..];
    let last = last.split("</FOLLOW_UP_QUESTIONS>").next().unwrap_or(last);
    let questions: Vec<String> = [&text[q1 + 4..q2], &text[q2 + 4..q3], last]
        .iter()
        .map(|q| q.trim().to_string())
        .collect();

    if questions.iter().all(|q| !q.is_empty()) {
        questions
    } else {
        Vec::new()
    }
}

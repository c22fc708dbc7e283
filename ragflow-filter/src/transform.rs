//! Payload transformation: query extraction and context injection.
//!
//! Everything here is pure. The pipeline calls [`extract_query`] on the
//! buffered request, sends the [`RetrievalQuery`] built by
//! [`build_retrieval_query`], and folds the response back in with
//! [`merge_result`].

use crate::config::RetrievalConfig;
use crate::error::TransformError;
use crate::message::{ChatMessage, Conversation};
use crate::retrieval::{RetrievalQuery, RetrievalResult};

/// Result of folding retrieved chunks into a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The conversation to forward upstream.
    pub conversation: Conversation,
    /// Whether any chunk passed the similarity threshold.
    pub matched: bool,
    /// Document ids of the injected chunks, in injection order.
    pub document_ids: Vec<String>,
}

/// Split off the last message as the query.
///
/// Returns the query text and the conversation without that message, in
/// its original order.
///
/// # Errors
///
/// Returns [`TransformError::EmptyConversation`] if there are no messages.
pub fn extract_query(
    mut conversation: Conversation,
) -> Result<(String, Conversation), TransformError> {
    let last = conversation.pop().ok_or(TransformError::EmptyConversation)?;
    Ok((last.content, conversation))
}

/// Build the retrieval request for `query` from the configured parameters.
pub fn build_retrieval_query(query: &str, config: &RetrievalConfig) -> RetrievalQuery {
    RetrievalQuery {
        question: query.to_string(),
        dataset_ids: config.dataset_ids.clone(),
        document_ids: config.document_ids.clone(),
        page: config.page,
        page_size: config.page_size,
        similarity_threshold: config.similarity_threshold,
        vector_similarity_weight: config.vector_similarity_weight,
        top_k: config.top_k,
        rerank_id: config.rerank_id.clone().unwrap_or_default(),
        keyword: config.keyword,
        highlight: config.highlight,
    }
}

/// Inject the chunks of `result` that meet the similarity threshold.
///
/// Each surviving chunk becomes a `user` message, in backend order, and a
/// final `user` message asks for an answer to `query`. When no chunk
/// survives, `remainder` is returned as-is with `matched == false`.
pub fn merge_result(
    remainder: Conversation,
    query: &str,
    result: &RetrievalResult,
    config: &RetrievalConfig,
) -> MergeOutcome {
    let threshold = config.similarity_threshold;
    let recalled: Vec<_> =
        result.chunks.iter().filter(|chunk| chunk.similarity >= threshold).collect();

    if recalled.is_empty() {
        return MergeOutcome { conversation: remainder, matched: false, document_ids: Vec::new() };
    }

    let mut conversation = remainder;
    conversation.reserve(recalled.len() + 1);
    let mut document_ids = Vec::with_capacity(recalled.len());
    for chunk in recalled {
        tracing::debug!(
            chunk.id = %chunk.id,
            document.id = %chunk.document_id,
            similarity = chunk.similarity,
            "chunk matched"
        );
        conversation.push(ChatMessage::user(chunk.content.clone()));
        document_ids.push(chunk.document_id.clone());
    }
    conversation.push(ChatMessage::user(config.render_answer_prompt(query)));

    MergeOutcome { conversation, matched: true, document_ids }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceEndpoint;
    use crate::message::Role;
    use crate::retrieval::RetrievedChunk;

    fn config() -> RetrievalConfig {
        RetrievalConfig::builder()
            .api_key("key")
            .endpoint("/api/v1/retrieval")
            .service(ServiceEndpoint { host: "h".into(), fqdn: "f".into(), port: 80 })
            .dataset_ids(["ds1"])
            .rerank_id("rr")
            .keyword(true)
            .build()
            .unwrap()
    }

    fn chunk(doc: &str, content: &str, similarity: f64) -> RetrievedChunk {
        RetrievedChunk {
            document_id: doc.into(),
            content: content.into(),
            similarity,
            ..Default::default()
        }
    }

    #[test]
    fn extract_query_takes_last_message() {
        let conversation = vec![
            ChatMessage::new(Role::System, "sys"),
            ChatMessage::user("first"),
            ChatMessage::new(Role::Assistant, "reply"),
            ChatMessage::user("question"),
        ];
        let (query, remainder) = extract_query(conversation.clone()).unwrap();
        assert_eq!(query, "question");
        assert_eq!(remainder, conversation[..3].to_vec());
    }

    #[test]
    fn extract_query_fails_on_empty_conversation() {
        assert_eq!(extract_query(Vec::new()), Err(TransformError::EmptyConversation));
    }

    #[test]
    fn builds_query_from_config() {
        let query = build_retrieval_query("why?", &config());
        assert_eq!(query.question, "why?");
        assert_eq!(query.dataset_ids, vec!["ds1"]);
        assert_eq!(query.rerank_id, "rr");
        assert!(query.keyword);
        assert_eq!(query.top_k, 1024);
    }

    #[test]
    fn merge_injects_chunks_then_instruction() {
        let result = RetrievalResult {
            chunks: vec![chunk("d1", "X", 0.5), chunk("d2", "low", 0.1), chunk("d3", "Y", 0.2)],
            ..Default::default()
        };
        let remainder = vec![ChatMessage::new(Role::System, "sys")];
        let outcome = merge_result(remainder, "why?", &result, &config());

        assert!(outcome.matched);
        assert_eq!(outcome.document_ids, vec!["d1", "d3"]);
        let contents: Vec<_> = outcome.conversation.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["sys", "X", "Y", "Now, please answer the following question:\nwhy?"]
        );
        assert!(outcome.conversation[1..].iter().all(|m| m.role == Role::User));
    }

    #[test]
    fn merge_without_survivors_leaves_remainder_untouched() {
        let result = RetrievalResult { chunks: vec![chunk("d1", "X", 0.19)], ..Default::default() };
        let remainder = vec![ChatMessage::user("earlier")];
        let outcome = merge_result(remainder.clone(), "why?", &result, &config());
        assert!(!outcome.matched);
        assert!(outcome.document_ids.is_empty());
        assert_eq!(outcome.conversation, remainder);
    }
}

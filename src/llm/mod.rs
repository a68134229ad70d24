//! Streaming LLM adapter: sentence segmentation, voice-tag filtering, and
//! the recursive tool-call continuation loop. See SPEC_FULL.md §4.2.

pub mod segmenter;

use crate::collaborators::{ContextManager, Llm, ToolCallFragment, ToolFn, ToolRegistry, ToolSpec};
use crate::data::{LlmMessage, LlmResponse, ToolCall};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use segmenter::{Segmenter, SegmenterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type RequestFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;
type OnBeforeToolCalls = Arc<dyn Fn(Vec<ToolCall>) -> BoxFuture<'static, ()> + Send + Sync>;

fn default_request_filter() -> RequestFilter {
    Arc::new(|text: &str| text.to_string())
}

fn default_on_before_tool_calls() -> OnBeforeToolCalls {
    Arc::new(|_calls: Vec<ToolCall>| Box::pin(async {}))
}

/// Turns a provider-specific streaming chat completion into an ordered
/// sequence of [`LlmResponse`] records.
pub struct LlmAdapter {
    llm: Arc<dyn Llm>,
    context_manager: Arc<dyn ContextManager>,
    segmenter_config: SegmenterConfig,
    history_limit: usize,
    request_filter: RequestFilter,
    on_before_tool_calls: OnBeforeToolCalls,
    tools: ToolRegistry,
}

impl LlmAdapter {
    /// Build an adapter around a concrete LLM provider and history store.
    pub fn new(llm: Arc<dyn Llm>, context_manager: Arc<dyn ContextManager>) -> Self {
        Self {
            llm,
            context_manager,
            segmenter_config: SegmenterConfig::default(),
            history_limit: 100,
            request_filter: default_request_filter(),
            on_before_tool_calls: default_on_before_tool_calls(),
            tools: ToolRegistry::default(),
        }
    }

    /// Override the sentence/voice-tag segmentation tunables.
    pub fn with_segmenter_config(mut self, config: SegmenterConfig) -> Self {
        self.segmenter_config = config;
        self
    }

    /// How many history entries to request from the context manager per turn.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Install a filter run on the raw input text before it is sent upstream.
    pub fn with_request_filter(mut self, filter: RequestFilter) -> Self {
        self.request_filter = filter;
        self
    }

    /// Install a hook awaited before any tool in a batch is executed.
    pub fn with_on_before_tool_calls(mut self, hook: OnBeforeToolCalls) -> Self {
        self.on_before_tool_calls = hook;
        self
    }

    /// Register a callable tool. Replaces any existing registration with the same name.
    pub fn with_tool(mut self, spec: ToolSpec, function: ToolFn) -> Self {
        self.tools.register(spec, function);
        self
    }

    /// Run one turn: filter the input, hydrate history, stream the model's
    /// reply (recursing through any tool calls), and persist the outcome.
    ///
    /// `files` is forwarded to the provider/collaborator layer uninterpreted;
    /// this crate does not inspect file contents. `system_prompt_params`,
    /// when non-empty, is injected as a leading system message.
    pub async fn chat_stream(
        &self,
        context_id: &str,
        text: &str,
        files: Vec<String>,
        system_prompt_params: Option<HashMap<String, String>>,
    ) -> Result<impl Stream<Item = Result<LlmResponse>>> {
        let _ = &files;
        let filtered = (self.request_filter)(text);

        let mut history = self
            .context_manager
            .get_histories(context_id, self.history_limit)
            .await?;
        match history.iter().position(|m| m.is_user()) {
            Some(pos) => {
                history.drain(..pos);
            }
            None => history.clear(),
        }

        if let Some(params) = system_prompt_params {
            if !params.is_empty() {
                let mut pairs: Vec<_> = params.into_iter().collect();
                pairs.sort();
                let content = pairs
                    .into_iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                history.insert(0, LlmMessage::System { content });
            }
        }

        // Everything from here on (the user message plus any tool round trip)
        // is new this turn and gets persisted via `add_histories` once the
        // turn settles; messages before this point came from the store
        // already and must not be written back.
        let message_length_at_start = history.len();
        history.push(LlmMessage::User { content: filtered });

        let (tx, rx) = mpsc::channel(32);
        let llm = self.llm.clone();
        let context_manager = self.context_manager.clone();
        let on_before_tool_calls = self.on_before_tool_calls.clone();
        let tools = self.tools.clone();
        let segmenter_config = self.segmenter_config.clone();
        let context_id = context_id.to_string();

        tokio::spawn(async move {
            let tx_err = tx.clone();
            if let Err(err) = drive_turn(
                llm,
                context_manager,
                on_before_tool_calls,
                tools,
                segmenter_config,
                context_id,
                history,
                message_length_at_start,
                tx,
            )
            .await
            {
                let _ = tx_err.send(Err(err)).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Drives one turn, recursing (iteratively) through tool-call completions.
/// See SPEC_FULL.md §4.2 "Tool calls" and §9 for why this loops instead of
/// recursing through an async fn.
async fn drive_turn(
    llm: Arc<dyn Llm>,
    context_manager: Arc<dyn ContextManager>,
    on_before_tool_calls: OnBeforeToolCalls,
    tools: ToolRegistry,
    segmenter_config: SegmenterConfig,
    context_id: String,
    mut messages: Vec<LlmMessage>,
    message_length_at_start: usize,
    tx: mpsc::Sender<Result<LlmResponse>>,
) -> Result<()> {
    loop {
        let tool_specs = (!tools.is_empty()).then(|| tools.specs());
        let mut stream = llm
            .get_llm_stream_response(&context_id, messages.clone(), tool_specs)
            .await?;

        let mut segmenter = Segmenter::new(segmenter_config.clone());
        let mut fragments: HashMap<(u32, u32), ToolCallFragment> = HashMap::new();
        let mut assistant_text = String::new();

        while let Some(delta) = stream.next().await {
            let delta = delta?;

            if let Some(content) = delta.content.as_deref() {
                for segment in segmenter.push_delta(content) {
                    assistant_text.push_str(&segment.text);
                    let response = LlmResponse {
                        context_id: context_id.clone(),
                        text: Some(segment.text),
                        voice_text: segment.voice_text,
                        tool_call: None,
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return Ok(());
                    }
                }
            }

            for fragment in delta.tool_call_fragments {
                let entry = fragments.entry(fragment.index).or_insert_with(|| ToolCallFragment {
                    index: fragment.index,
                    ..Default::default()
                });
                if let Some(id) = fragment.id {
                    entry.id = Some(id);
                }
                if let Some(name) = fragment.name {
                    entry.name = Some(name);
                }
                if let Some(args) = fragment.arguments_fragment {
                    entry.arguments_fragment.get_or_insert_with(String::new).push_str(&args);
                }
            }

            tokio::task::yield_now().await;
        }

        if let Some(segment) = segmenter.flush() {
            assistant_text.push_str(&segment.text);
            let response = LlmResponse {
                context_id: context_id.clone(),
                text: Some(segment.text),
                voice_text: segment.voice_text,
                tool_call: None,
            };
            if tx.send(Ok(response)).await.is_err() {
                return Ok(());
            }
        }

        if fragments.is_empty() {
            messages.push(LlmMessage::Assistant { content: assistant_text, tool_calls: vec![] });
            context_manager
                .add_histories(&context_id, messages[message_length_at_start..].to_vec(), "default")
                .await?;
            return Ok(());
        }

        let mut ordered: Vec<_> = fragments.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        let tool_calls: Vec<ToolCall> = ordered
            .into_iter()
            .map(|(_, fragment)| ToolCall {
                id: fragment.id,
                name: fragment.name.unwrap_or_default(),
                arguments: fragment.arguments_fragment.unwrap_or_default(),
            })
            .collect();

        for call in &tool_calls {
            let response = LlmResponse {
                context_id: context_id.clone(),
                text: None,
                voice_text: None,
                tool_call: Some(call.clone()),
            };
            if tx.send(Ok(response)).await.is_err() {
                return Ok(());
            }
        }

        on_before_tool_calls(tool_calls.clone()).await;

        messages.push(LlmMessage::Assistant {
            content: assistant_text,
            tool_calls: tool_calls.clone(),
        });

        for call in &tool_calls {
            let arguments: serde_json::Value =
                serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
            let outcome = match tools.get(&call.name) {
                Some(function) => function(arguments).await,
                None => Err(Error::ToolExecutionError {
                    name: call.name.clone(),
                    message: "no tool registered with this name".to_string(),
                }),
            };
            let content = match outcome {
                Ok(value) => serde_json::to_string(&value)?,
                Err(err) => {
                    tracing::error!(tool = %call.name, error = %err, "tool execution failed");
                    serde_json::to_string(&serde_json::json!({ "error": err.to_string() }))?
                }
            };
            messages.push(LlmMessage::Tool {
                tool_call_id: call.id.clone().unwrap_or_default(),
                content,
            });
        }
    }
}

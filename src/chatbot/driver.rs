use std::sync::Arc;

use async_trait::async_trait;
use channel_transport::NormalizedMessage;
use moka::future::Cache;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BotFlow, ChatbotFlow, ConversationFrame, FallbackType, FormFlow, FrameStatus};
use crate::agent::{AgentConfig, AgentDirectory};
use crate::config::EngineConfig;
use crate::error::FlowError;
use crate::flow::FlowEngine;
use crate::registry::{FunctionRegistry, IntoHandler};
use crate::state::StateBag;
use crate::store::ConversationStore;

/// Where the driver's replies go, usually the channel the message came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, text: &str) -> Result<(), FlowError>;
}

/// Everything an agent hand-off needs to answer one message.
#[derive(Debug, Clone, Copy)]
pub struct HandoffRequest<'a> {
    pub agent: &'a AgentConfig,
    pub conversation_key: &'a str,
    pub user_text: &'a str,
    pub message: &'a NormalizedMessage,
}

/// Called when a conversation reaches an agent flow.
#[async_trait]
pub trait AiHandoff: Send + Sync {
    async fn generate(
        &self,
        request: HandoffRequest<'_>,
        on_reply: &dyn ReplySink,
    ) -> Result<(), FlowError>;
}

/// Drives chat-bot conversations: one `run` per inbound message.
///
/// Turns for the same conversation key are serialized, so frames are
/// appended and read in a single total order.
pub struct SessionDriver {
    store: Arc<dyn ConversationStore>,
    engine: FlowEngine,
    agents: AgentDirectory,
    generic_error: String,
    locks: Cache<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("store", &self.store.name())
            .field("agents", &self.agents.ids().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionDriver {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<FunctionRegistry>,
        agents: AgentDirectory,
        config: EngineConfig,
    ) -> Self {
        let locks = Cache::builder().time_to_idle(config.state_ttl).build();
        let generic_error = config.generic_error.clone();
        Self {
            store,
            engine: FlowEngine::with_registry(registry, config),
            agents,
            generic_error,
            locks,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn agents(&self) -> &AgentDirectory {
        &self.agents
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        self.engine.registry()
    }

    /// Register the handler run with the collected answers when the form
    /// `form_key` completes. Submit handlers live under their own `form:`
    /// names, so a form never reaches a step function of the same name.
    pub fn register_submit_handler<Args, F: IntoHandler<Args>>(&self, form_key: &str, f: F) {
        self.registry().register(submit_handler_name(form_key), f);
    }

    /// Handle one user message. Internal failures are answered with a generic
    /// text (the bot's text fallback, else the configured default) and then
    /// returned; transport failures are only returned.
    #[tracing::instrument(name = "session_turn", skip_all, fields(conversation = %conversation_key))]
    pub async fn run(
        &self,
        msg: &NormalizedMessage,
        conversation_key: &str,
        user_text: &str,
        bot: &ChatbotFlow,
        on_reply: &dyn ReplySink,
        on_ai: &dyn AiHandoff,
    ) -> Result<(), FlowError> {
        let lock = self
            .locks
            .get_with(conversation_key.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        let turn = Turn {
            driver: self,
            msg,
            key: conversation_key,
            user_text,
            bot,
            on_reply,
            on_ai,
        };
        let result = turn.play().await;
        if let Err(e) = &result {
            error!(kind = e.kind(), error = %e, "conversation turn failed");
            if !matches!(e, FlowError::Transport(_) | FlowError::Channel(_)) {
                let text = match bot.fallback_response_type {
                    FallbackType::Text if !bot.fallback_response.is_empty() => &bot.fallback_response,
                    _ => &self.generic_error,
                };
                if let Err(send) = on_reply.reply(text).await {
                    warn!(error = %send, "could not deliver error reply");
                }
            }
        }
        result
    }
}

/// One message being handled.
struct Turn<'a> {
    driver: &'a SessionDriver,
    msg: &'a NormalizedMessage,
    key: &'a str,
    user_text: &'a str,
    bot: &'a ChatbotFlow,
    on_reply: &'a dyn ReplySink,
    on_ai: &'a dyn AiHandoff,
}

impl Turn<'_> {
    async fn play(&self) -> Result<(), FlowError> {
        if let Some(target) = self.bot.keyword_target(self.user_text) {
            debug!(flow = target, "keyword matched");
            return self.enter(target.to_string(), true).await;
        }

        let frame = match self.driver.store.latest(self.key).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not read conversation state, starting over");
                None
            }
        };
        let Some(frame) = frame else {
            return self.fallback().await;
        };

        let flow = match self.bot.flows.get(&frame.flow_key) {
            Some(flow) => flow.clone(),
            None => match frame.flow.clone() {
                Some(snapshot) => snapshot,
                None => {
                    warn!(flow = %frame.flow_key, "stored flow no longer exists");
                    return self.fallback().await;
                }
            },
        };

        match flow {
            BotFlow::Menu(menu) => match menu.option_for(self.user_text) {
                Some(option) if !option.next_flow.is_empty() => {
                    self.enter(option.next_flow.clone(), true).await
                }
                Some(option) if !option.response.is_empty() => {
                    self.say(&option.response).await?;
                    let next = ConversationFrame::new(&frame.flow_key, self.user_text)
                        .with_flow(&BotFlow::Menu(menu.clone()));
                    self.append(&next).await
                }
                _ => self.enter(frame.flow_key.clone(), true).await,
            },
            BotFlow::Form(form) => self.continue_form(frame, &form).await,
            BotFlow::Agent(_) => self.enter(frame.flow_key.clone(), true).await,
        }
    }

    async fn say(&self, text: &str) -> Result<(), FlowError> {
        self.on_reply.reply(text).await
    }

    async fn append(&self, frame: &ConversationFrame) -> Result<(), FlowError> {
        self.driver.store.append(self.key, frame).await?;
        info!(
            target: "event",
            event = "frame_appended",
            key = self.key,
            flow = %frame.flow_key,
            step = frame.step_index,
            waiting = frame.is_waiting()
        );
        Ok(())
    }

    async fn fallback(&self) -> Result<(), FlowError> {
        match self.bot.fallback_response_type {
            FallbackType::Text => {
                if self.bot.fallback_response.is_empty() {
                    debug!("no flow matched and no fallback text configured");
                    return Ok(());
                }
                self.say(&self.bot.fallback_response).await
            }
            FallbackType::Flow => self.enter(self.bot.fallback_response.clone(), true).await,
        }
    }

    /// Start `target` from the top. Forms without steps complete immediately
    /// and continue with their `back_to_flow`; `handoff` is false once the
    /// user's text has been consumed, so agents are not asked about it.
    async fn enter(&self, mut target: String, mut handoff: bool) -> Result<(), FlowError> {
        for _ in 0..=self.bot.flows.len() {
            let flow = self
                .bot
                .flows
                .get(&target)
                .ok_or_else(|| FlowError::Config(format!("unknown flow `{target}`")))?;
            match flow {
                BotFlow::Menu(menu) => {
                    self.say(&menu.render()).await?;
                    let frame = ConversationFrame::new(&target, self.user_text).with_flow(flow);
                    return self.append(&frame).await;
                }
                BotFlow::Agent(agent) => {
                    if handoff {
                        let config = self.driver.agents.get(&agent.agent_id).ok_or_else(|| {
                            FlowError::Config(format!("unknown agent `{}`", agent.agent_id))
                        })?;
                        let request = HandoffRequest {
                            agent: config,
                            conversation_key: self.key,
                            user_text: self.user_text,
                            message: self.msg,
                        };
                        info!(target: "event", event = "agent_handoff", key = self.key, agent = %agent.agent_id);
                        self.on_ai.generate(request, self.on_reply).await?;
                    }
                    let frame = ConversationFrame::new(&target, self.user_text).with_flow(flow);
                    return self.append(&frame).await;
                }
                BotFlow::Form(form) => {
                    if let Some(first) = form.steps.first() {
                        self.say(&first.question).await?;
                        let frame = ConversationFrame::new(&target, self.user_text)
                            .at_step(0, FrameStatus::WaitingInput)
                            .with_flow(flow);
                        return self.append(&frame).await;
                    }
                    match self.complete(&target, form, Map::new()).await? {
                        Some(next) => {
                            target = next;
                            handoff = false;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
        Err(FlowError::Config(format!(
            "flow `{target}` loops through forms without steps"
        )))
    }

    async fn continue_form(&self, frame: ConversationFrame, form: &FormFlow) -> Result<(), FlowError> {
        let flow = BotFlow::Form(form.clone());
        let Some(step) = form.steps.get(frame.step_index) else {
            debug!(flow = %frame.flow_key, "form already complete");
            return Ok(());
        };

        if !frame.is_waiting() {
            self.say(&step.question).await?;
            let next = ConversationFrame::new(&frame.flow_key, self.user_text)
                .at_step(frame.step_index, FrameStatus::WaitingInput)
                .with_data(frame.collected_data)
                .with_flow(&flow);
            return self.append(&next).await;
        }

        if let Some(validation) = &step.validation {
            match validation.check(self.user_text) {
                Ok(()) => {}
                Err(FlowError::Validation(message)) => {
                    debug!(field = %step.field, "answer rejected");
                    self.say(&message).await?;
                    let retry = ConversationFrame::new(&frame.flow_key, self.user_text)
                        .at_step(frame.step_index, FrameStatus::WaitingInput)
                        .with_data(frame.collected_data)
                        .with_flow(&flow);
                    return self.append(&retry).await;
                }
                Err(other) => return Err(other),
            }
        }

        let mut data = frame.collected_data;
        data.insert(step.field.clone(), Value::String(self.user_text.to_string()));

        let next_index = frame.step_index + 1;
        match form.steps.get(next_index) {
            Some(next_step) => {
                self.say(&next_step.question).await?;
                let next = ConversationFrame::new(&frame.flow_key, self.user_text)
                    .at_step(next_index, FrameStatus::WaitingInput)
                    .with_data(data)
                    .with_flow(&flow);
                self.append(&next).await
            }
            None => match self.complete(&frame.flow_key, form, data).await? {
                Some(back) => self.enter(back, false).await,
                None => Ok(()),
            },
        }
    }

    /// Finish a form: confirm, persist the completed frame, run the form's
    /// submit handler. Returns the flow to go back to.
    async fn complete(
        &self,
        flow_key: &str,
        form: &FormFlow,
        data: Map<String, Value>,
    ) -> Result<Option<String>, FlowError> {
        if !form.completion_message.is_empty() {
            self.say(&form.completion_message).await?;
        }
        let done = ConversationFrame::new(flow_key, self.user_text)
            .at_step(form.steps.len(), FrameStatus::Idle)
            .with_data(data.clone())
            .with_flow(&BotFlow::Form(form.clone()));
        self.append(&done).await?;

        let registry = self.driver.engine.registry();
        let handler = submit_handler_name(flow_key);
        if registry.contains(&handler) {
            let engine = self
                .driver
                .engine
                .clone()
                .with_state(StateBag::from_map(data.clone()));
            registry
                .call(&handler, vec![Value::Object(data)], &engine)
                .await?;
            info!(target: "event", event = "form_submitted", key = self.key, flow = flow_key);
        }

        Ok(Some(form.back_to_flow.clone()).filter(|b| !b.is_empty()))
    }
}

/// Registry name of the submit handler for form `form_key`.
pub fn submit_handler_name(form_key: &str) -> String {
    format!("form:{form_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryConversationStore;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(StdMutex<Vec<String>>);

    impl Collect {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[async_trait]
    impl ReplySink for Collect {
        async fn reply(&self, text: &str) -> Result<(), FlowError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct NoAgents(StdMutex<usize>);

    #[async_trait]
    impl AiHandoff for NoAgents {
        async fn generate(
            &self,
            request: HandoffRequest<'_>,
            on_reply: &dyn ReplySink,
        ) -> Result<(), FlowError> {
            *self.0.lock().unwrap() += 1;
            on_reply.reply(&format!("agent {}", request.agent.id)).await
        }
    }

    fn bot(value: Value) -> ChatbotFlow {
        serde_json::from_value(value).unwrap()
    }

    fn driver() -> SessionDriver {
        SessionDriver::new(
            InMemoryConversationStore::new(Duration::from_secs(60), 50),
            FunctionRegistry::new(),
            AgentDirectory::default(),
            EngineConfig::default(),
        )
    }

    async fn say(driver: &SessionDriver, bot: &ChatbotFlow, sink: &Collect, text: &str) -> Vec<String> {
        let msg = NormalizedMessage::text("test", "u1", text);
        let _ = driver
            .run(&msg, "u1@test", text, bot, sink, &NoAgents::default())
            .await;
        sink.take()
    }

    #[tokio::test]
    async fn option_response_is_sent_and_menu_kept() {
        let bot = bot(json!({
            "keywords": {"hi": "main"},
            "flows": {"main": {"type": "menu", "text": "Pick:", "options": [
                {"input": "1", "display": "Hours", "response": "9 to 5"}
            ]}}
        }));
        let driver = driver();
        let sink = Collect::default();
        assert_eq!(say(&driver, &bot, &sink, "hi").await, vec!["Pick:\n\n[1] Hours"]);
        assert_eq!(say(&driver, &bot, &sink, "1").await, vec!["9 to 5"]);
        assert_eq!(say(&driver, &bot, &sink, "zzz").await, vec!["Pick:\n\n[1] Hours"]);

        let latest = driver.store().latest("u1@test").await.unwrap().unwrap();
        assert_eq!(latest.flow_key, "main");
        assert_eq!(latest.status, FrameStatus::Idle);
    }

    #[tokio::test]
    async fn multi_step_form_collects_answers() {
        let bot = bot(json!({
            "keywords": {"signup": "form"},
            "flows": {"form": {"type": "form", "completion_message": "Thanks!", "steps": [
                {"field": "name", "question": "Name?",
                 "validation": {"type": "min_length", "value": 2}},
                {"field": "code", "question": "Code?",
                 "validation": {"type": "regex", "value": "^[0-9]+$", "error_message": "Digits only."}}
            ]}}
        }));
        let driver = driver();
        let sink = Collect::default();
        assert_eq!(say(&driver, &bot, &sink, "signup").await, vec!["Name?"]);
        assert_eq!(
            say(&driver, &bot, &sink, "A").await,
            vec!["Please enter at least 2 characters."]
        );
        assert_eq!(say(&driver, &bot, &sink, "Ada").await, vec!["Code?"]);
        assert_eq!(say(&driver, &bot, &sink, "x1").await, vec!["Digits only."]);
        assert_eq!(say(&driver, &bot, &sink, "42").await, vec!["Thanks!"]);

        let latest = driver.store().latest("u1@test").await.unwrap().unwrap();
        assert_eq!(latest.step_index, 2);
        assert_eq!(latest.collected_data, json!({"name": "Ada", "code": "42"}).as_object().cloned().unwrap());

        assert!(say(&driver, &bot, &sink, "anything").await.is_empty());
    }

    #[tokio::test]
    async fn submit_handler_receives_collected_data() {
        let bot = bot(json!({
            "keywords": {"go": "ask"},
            "flows": {"ask": {"type": "form", "completion_message": "Saved.", "steps": [
                {"field": "color", "question": "Color?"}
            ]}}
        }));
        let driver = driver();
        let received: Arc<StdMutex<Vec<Value>>> = Arc::default();
        let seen = received.clone();
        driver.register_submit_handler("ask", move |data: Value| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(data);
                Ok::<_, String>(())
            }
        });
        let sink = Collect::default();
        say(&driver, &bot, &sink, "go").await;
        assert_eq!(say(&driver, &bot, &sink, "blue").await, vec!["Saved."]);
        assert_eq!(*received.lock().unwrap(), vec![json!({"color": "blue"})]);
    }

    #[tokio::test]
    async fn form_named_like_a_builtin_skips_it() {
        let bot = bot(json!({
            "keywords": {"go": "fail"},
            "flows": {"fail": {"type": "form", "completion_message": "Saved.", "steps": [
                {"field": "color", "question": "Color?"}
            ]}}
        }));
        let driver = SessionDriver::new(
            InMemoryConversationStore::new(Duration::from_secs(60), 50),
            FunctionRegistry::with_builtins(),
            AgentDirectory::default(),
            EngineConfig::default(),
        );
        assert!(driver.registry().contains("fail"));
        let sink = Collect::default();
        say(&driver, &bot, &sink, "go").await;
        assert_eq!(say(&driver, &bot, &sink, "blue").await, vec!["Saved."]);
        assert!(!driver.registry().contains(&submit_handler_name("fail")));
    }

    #[tokio::test]
    async fn text_fallback_without_frame() {
        let bot = bot(json!({
            "flows": {},
            "fallback_response_type": "text",
            "fallback_response": "Say 'menu'."
        }));
        let sink = Collect::default();
        assert_eq!(say(&driver(), &bot, &sink, "xyz").await, vec!["Say 'menu'."]);
    }

    #[tokio::test]
    async fn unknown_agent_sends_generic_error() {
        let bot = bot(json!({
            "keywords": {"help": "assistant"},
            "flows": {"assistant": {"type": "agent", "agent_id": "missing"}}
        }));
        let sink = Collect::default();
        let driver = driver();
        let msg = NormalizedMessage::text("test", "u1", "help");
        let err = driver
            .run(&msg, "u1@test", "help", &bot, &sink, &NoAgents::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert_eq!(sink.take(), vec![EngineConfig::default().generic_error]);
    }

    #[tokio::test]
    async fn empty_forms_chain_to_back_to_flow() {
        let bot = bot(json!({
            "keywords": {"go": "notice"},
            "flows": {
                "notice": {"type": "form", "completion_message": "Nothing to fill.", "back_to_flow": "main"},
                "main": {"type": "menu", "text": "Main", "options": []}
            }
        }));
        let sink = Collect::default();
        assert_eq!(
            say(&driver(), &bot, &sink, "go").await,
            vec!["Nothing to fill.", "Main"]
        );
    }
}

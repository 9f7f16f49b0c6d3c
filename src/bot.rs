//! Inbound update classification and dispatch.
//!
//! Every update becomes an [`Event`] over a closed set of [`Inbound`] kinds.
//! [`Bot::dispatch`] gates the sender through the whitelist, then matches on
//! the kind. URL triggers and `/retry` start pipeline jobs in the background.

use crate::{
    access::AccessGate,
    chat::{ChatChannel, ChatError, ChatId, InlineKeyboard, MessageRef, escape_html},
    dedup::TaskDeduplicator,
    extract::Site,
    jobs::{ExtractionJob, JobState},
    pipeline::PipelineOrchestrator,
    profile::{PrincipalDirectory, normalize_alias},
    render::{self, AllowedRow},
    stats::{self, UsageStats},
    store::StoreError,
    telegram::{Update, User},
};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CROP_CHOICES: [u8; 4] = [0, 5, 10, 15];

const MSG_DENIED: &str =
    "Доступ обмежено. Зверніться до адміністратора для внесення до білого списку.";
const MSG_BUSY: &str = "⏳ Попереднє посилання ще обробляється. Дочекайтеся результату.";
const MSG_UNSUPPORTED: &str = "Підтримуються лише посилання на оголошення OLX та Otodom.";
const MSG_NO_HISTORY: &str = "Немає попереднього посилання для повтору.";
const MSG_STORE_DOWN: &str = "⚠️ Сервіс тимчасово недоступний. Спробуйте пізніше.";
const MSG_GREETING: &str = "👋 Привіт! Надішли посилання на оголошення OLX або Otodom — я зберу зображення.\n\
     Використовуй /crop, щоб налаштувати обрізання.";
const MSG_HELP: &str = "🤖 Бот для збору зображень з OLX та Otodom.\n\n\
     Команди користувача:\n\
     /start — почати\n\
     /crop — обрізка знизу (через кнопки)\n\
     /retry — повтор останнього посилання";
const MSG_ADMIN_HELP: &str = "Адмін команди:\n\
     <code>/allow id</code> — додати за числовим ID\n\
     <code>/allow_username @нік</code> — додати за нікнеймом\n\
     /allow_from_forward — перешліть повідомлення користувача\n\
     <code>/deny id</code> — видалити з білого списку\n\
     /allowed — показати дозволених користувачів\n\
     /stats — показати статистику\n\
     <code>/setname id Повне Імʼя</code> — вручну змінити імʼя";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    UrlMessage {
        url: String,
    },
    /// `value` is `None` when the callback payload is not a number.
    CropSelection {
        callback_id: String,
        value: Option<u8>,
        message: Option<MessageRef>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Crop,
    Retry,
    Admin,
    Allow(Vec<String>),
    AllowUsername(Vec<String>),
    AllowFromForward,
    Deny(Vec<String>),
    Allowed,
    Stats,
    SetName(String),
    Unknown(String),
}

impl Command {
    /// Parses `/name[@bot] args…`.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let body = text.strip_prefix('/')?;
        let (head, rest) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        let name = head.split('@').next().unwrap_or_default().to_lowercase();
        let args = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        Some(match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "crop" => Command::Crop,
            "retry" => Command::Retry,
            "admin" => Command::Admin,
            "allow" => Command::Allow(args()),
            "allow_username" => Command::AllowUsername(args()),
            "allow_from_forward" => Command::AllowFromForward,
            "deny" => Command::Deny(args()),
            "allowed" => Command::Allowed,
            "stats" => Command::Stats,
            "setname" => Command::SetName(rest.to_string()),
            _ => Command::Unknown(name),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminView {
    Allowed,
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Trigger(Trigger),
    Command(Command),
    AdminPanel {
        callback_id: String,
        view: AdminView,
        message: Option<MessageRef>,
    },
    Forward {
        sender: Option<User>,
        text: Option<String>,
    },
    UnknownCallback {
        callback_id: String,
    },
    Text,
}

impl Inbound {
    fn is_callback(&self) -> bool {
        matches!(
            self,
            Inbound::Trigger(Trigger::CropSelection { .. })
                | Inbound::AdminPanel { .. }
                | Inbound::UnknownCallback { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub sender: User,
    pub chat: ChatId,
    pub inbound: Inbound,
}

fn is_url(text: &str) -> bool {
    text.starts_with("http")
}

/// Maps a raw update onto an event; updates without a sender are dropped.
pub fn classify(update: Update) -> Option<Event> {
    if let Some(callback) = update.callback_query {
        let message = callback.message.as_ref().map(|m| MessageRef {
            chat_id: m.chat.id,
            message_id: m.message_id,
        });
        let chat = message
            .map(|m| m.chat_id)
            .unwrap_or(callback.from.id as ChatId);
        let data = callback.data.unwrap_or_default();
        let callback_id = callback.id;
        let inbound = if let Some(raw) = data.strip_prefix("set_crop:") {
            Inbound::Trigger(Trigger::CropSelection {
                callback_id,
                value: raw.trim().parse().ok(),
                message,
            })
        } else {
            match data.as_str() {
                "admin:allowed" => Inbound::AdminPanel {
                    callback_id,
                    view: AdminView::Allowed,
                    message,
                },
                "admin:stats" => Inbound::AdminPanel {
                    callback_id,
                    view: AdminView::Stats,
                    message,
                },
                _ => Inbound::UnknownCallback { callback_id },
            }
        };
        return Some(Event {
            sender: callback.from,
            chat,
            inbound,
        });
    }

    let message = update.message?;
    let sender = message.from.clone()?;
    let text = message.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let inbound = if message.is_forward() {
        Inbound::Forward {
            sender: message.forwarded_sender().cloned(),
            text: text.map(str::to_string),
        }
    } else {
        match text {
            Some(t) if t.starts_with('/') => Command::parse(t)
                .map(Inbound::Command)
                .unwrap_or(Inbound::Text),
            Some(t) if is_url(t) => Inbound::Trigger(Trigger::UrlMessage { url: t.to_string() }),
            _ => Inbound::Text,
        }
    };
    Some(Event {
        sender,
        chat: message.chat.id,
        inbound,
    })
}

pub fn crop_keyboard() -> InlineKeyboard {
    InlineKeyboard::row(
        CROP_CHOICES
            .iter()
            .map(|p| (format!("{p}%"), format!("set_crop:{p}"))),
    )
}

fn admin_keyboard() -> InlineKeyboard {
    InlineKeyboard::row([
        ("👥 Дозволені".to_string(), "admin:allowed".to_string()),
        ("📊 Статистика".to_string(), "admin:stats".to_string()),
    ])
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Bot {
    chat: Arc<dyn ChatChannel>,
    gate: Arc<AccessGate>,
    dedup: Arc<TaskDeduplicator>,
    orchestrator: Arc<PipelineOrchestrator>,
    directory: PrincipalDirectory,
    stats: UsageStats,
    default_crop: u8,
    jobs: Mutex<JoinSet<JobState>>,
}

impl Bot {
    pub fn new(
        chat: Arc<dyn ChatChannel>,
        gate: Arc<AccessGate>,
        dedup: Arc<TaskDeduplicator>,
        orchestrator: Arc<PipelineOrchestrator>,
        directory: PrincipalDirectory,
        stats: UsageStats,
        default_crop: u8,
    ) -> Self {
        Self {
            chat,
            gate,
            dedup,
            orchestrator,
            directory,
            stats,
            default_crop,
            jobs: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn dispatch(&self, event: Event) {
        let principal = event.sender.id;
        if !self.gate.is_allowed(principal).await {
            crate::metrics::inc_access_denied();
            info!(target = "listing_bot.bot", principal, "access_denied");
            if !event.inbound.is_callback()
                && let Err(err) = self.reply(event.chat, MSG_DENIED).await
            {
                warn!(target = "listing_bot.bot", principal, error = %err, "denial reply failed");
            }
            return;
        }

        self.remember(&event.sender).await;
        let chat = event.chat;
        let result = match event.inbound {
            Inbound::Trigger(Trigger::UrlMessage { url }) => self.on_url(&event.sender, chat, &url).await,
            Inbound::Trigger(Trigger::CropSelection {
                callback_id,
                value,
                message,
            }) => self.on_crop_selected(principal, &callback_id, value, message).await,
            Inbound::Command(command) => self.on_command(&event.sender, chat, command).await,
            Inbound::AdminPanel {
                callback_id,
                view,
                message,
            } => self.on_admin_panel(principal, chat, &callback_id, view, message).await,
            Inbound::Forward { sender, text } => self.on_forward(&event.sender, chat, sender, text).await,
            Inbound::UnknownCallback { callback_id } => {
                self.chat.answer_callback(&callback_id, None).await.map_err(Into::into)
            }
            Inbound::Text => {
                debug!(target = "listing_bot.bot", principal, "plain_text_ignored");
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(target = "listing_bot.bot", principal, error = %err, "handler_failed");
            if matches!(err, HandlerError::Store(_))
                && let Err(err) = self.reply(chat, MSG_STORE_DOWN).await
            {
                warn!(target = "listing_bot.bot", principal, error = %err, "fallback reply failed");
            }
        }
    }

    /// Waits for every job started so far. Used on shutdown and in tests.
    pub async fn wait_for_jobs(&self) -> Vec<JobState> {
        let mut jobs = {
            let mut guard = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut states = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(state) => states.push(state),
                Err(err) => warn!(target = "listing_bot.bot", error = %err, "job_task_failed"),
            }
        }
        states
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.dedup.in_flight()
    }

    async fn reply(&self, chat: ChatId, text: &str) -> Result<(), ChatError> {
        self.chat.send_text(chat, text, None).await.map(|_| ())
    }

    async fn remember(&self, user: &User) {
        let full_name = user.full_name();
        if let Err(err) = self
            .directory
            .remember(user.id, user.username.as_deref(), Some(full_name.as_str()))
            .await
        {
            debug!(target = "listing_bot.bot", principal = user.id, error = %err, "directory_refresh_failed");
        }
    }

    async fn on_url(&self, sender: &User, chat: ChatId, url: &str) -> Result<(), HandlerError> {
        if Site::detect(url).is_none() {
            self.reply(chat, MSG_UNSUPPORTED).await?;
            return Ok(());
        }
        self.start_job(sender.id, chat, url).await
    }

    async fn start_job(&self, principal: u64, chat: ChatId, url: &str) -> Result<(), HandlerError> {
        let Some(slot) = self.dedup.acquire_slot(principal) else {
            info!(target = "listing_bot.bot", principal, "job_rejected_in_flight");
            self.reply(chat, MSG_BUSY).await?;
            return Ok(());
        };
        let crop = match self.directory.load_profile(principal).await {
            Ok(profile) => profile.crop_percentage.unwrap_or(self.default_crop),
            Err(err) => {
                warn!(target = "listing_bot.bot", principal, error = %err, "profile unavailable; default crop");
                self.default_crop
            }
        };
        let job = ExtractionJob::new(principal, chat, url, crop);
        let orchestrator = self.orchestrator.clone();
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while jobs.try_join_next().is_some() {}
        jobs.spawn(async move { orchestrator.run(job, slot).await });
        Ok(())
    }

    async fn on_crop_selected(
        &self,
        principal: u64,
        callback_id: &str,
        value: Option<u8>,
        message: Option<MessageRef>,
    ) -> Result<(), HandlerError> {
        let Some(value) = value else {
            self.chat.answer_callback(callback_id, Some("Помилка значення")).await?;
            return Ok(());
        };
        if !CROP_CHOICES.contains(&value) {
            self.chat.answer_callback(callback_id, Some("Недопустиме значення")).await?;
            return Ok(());
        }
        let mut profile = self.directory.load_profile(principal).await?;
        profile.crop_percentage = Some(value);
        self.directory.save_profile(principal, &profile).await?;
        if let Some(message) = message {
            self.chat
                .edit_text(message, &crop_status(value), Some(&crop_keyboard()))
                .await?;
        }
        self.chat.answer_callback(callback_id, Some("Оновлено")).await?;
        Ok(())
    }

    async fn on_command(&self, sender: &User, chat: ChatId, command: Command) -> Result<(), HandlerError> {
        let principal = sender.id;
        match command {
            Command::Start => self.reply(chat, MSG_GREETING).await?,
            Command::Help => self.reply(chat, MSG_HELP).await?,
            Command::Crop => {
                let profile = self.directory.load_profile(principal).await?;
                let crop = profile.crop_percentage.unwrap_or(self.default_crop);
                self.chat
                    .send_text(chat, &crop_status(crop), Some(&crop_keyboard()))
                    .await?;
            }
            Command::Retry => {
                let profile = self.directory.load_profile(principal).await?;
                match profile.last_url {
                    Some(url) => self.start_job(principal, chat, &url).await?,
                    None => self.reply(chat, MSG_NO_HISTORY).await?,
                }
            }
            Command::Unknown(name) => {
                debug!(target = "listing_bot.bot", principal, command = %name, "unknown_command");
            }
            admin if !self.gate.is_admin(principal) => {
                debug!(target = "listing_bot.bot", principal, command = ?admin, "admin_command_ignored");
            }
            Command::Admin => {
                self.chat
                    .send_text(chat, MSG_ADMIN_HELP, Some(&admin_keyboard()))
                    .await?;
            }
            Command::Allow(args) => self.admin_allow(chat, &args).await?,
            Command::AllowUsername(args) => self.admin_allow_username(chat, &args).await?,
            Command::AllowFromForward => {
                self.directory.arm_forward_window(principal).await?;
                self.reply(chat, "Перешліть повідомлення від користувача, щоб додати його")
                    .await?;
            }
            Command::Deny(args) => self.admin_deny(chat, &args).await?,
            Command::Allowed => {
                let text = self.allowed_table().await?;
                self.reply(chat, &text).await?;
            }
            Command::Stats => {
                let text = self.usage_report().await?;
                self.reply(chat, &text).await?;
            }
            Command::SetName(rest) => self.admin_set_name(chat, &rest).await?,
        }
        Ok(())
    }

    async fn admin_allow(&self, chat: ChatId, args: &[String]) -> Result<(), HandlerError> {
        let [arg] = args else {
            self.reply(chat, "Формат: /allow id або @нік").await?;
            return Ok(());
        };
        let principal = if arg.starts_with('@') {
            match self.directory.resolve_alias(arg).await? {
                Some(id) => id,
                None => {
                    self.reply(
                        chat,
                        "Немає відповідності для цього ніку. Використайте /allow_from_forward та перешліть повідомлення користувача.",
                    )
                    .await?;
                    return Ok(());
                }
            }
        } else {
            match arg.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    self.reply(chat, "Невірний id").await?;
                    return Ok(());
                }
            }
        };
        self.gate.allow(principal).await?;
        self.reply(chat, &format!("Додано {principal} до білого списку")).await?;
        Ok(())
    }

    async fn admin_allow_username(&self, chat: ChatId, args: &[String]) -> Result<(), HandlerError> {
        let alias = match args {
            [arg] if arg.starts_with('@') => normalize_alias(arg),
            _ => None,
        };
        let Some(alias) = alias else {
            self.reply(chat, "Формат: /allow_username @нік").await?;
            return Ok(());
        };
        if let Some(principal) = self.directory.resolve_alias(&alias).await? {
            self.gate.allow(principal).await?;
            self.directory.link_alias(principal, &alias).await?;
            self.reply(chat, &format!("Додано {principal} до білого списку")).await?;
            return Ok(());
        }
        self.directory.mark_pending_alias(&alias).await?;
        self.reply(
            chat,
            &format!(
                "Нік {} збережено, але користувача ще не додано.\n\
                 Використайте /allow_from_forward і перешліть повідомлення користувача,\n\
                 або попросіть його написати боту /start.",
                escape_html(&alias)
            ),
        )
        .await?;
        Ok(())
    }

    async fn admin_deny(&self, chat: ChatId, args: &[String]) -> Result<(), HandlerError> {
        let [arg] = args else {
            self.reply(chat, "Формат: /deny id").await?;
            return Ok(());
        };
        let Ok(principal) = arg.parse::<u64>() else {
            self.reply(chat, "Невірний id").await?;
            return Ok(());
        };
        self.gate.deny(principal).await?;
        self.reply(chat, &format!("Видалено {principal} з білого списку")).await?;
        Ok(())
    }

    async fn admin_set_name(&self, chat: ChatId, rest: &str) -> Result<(), HandlerError> {
        let parsed = rest
            .split_once(char::is_whitespace)
            .map(|(id, name)| (id, name.trim()))
            .filter(|(_, name)| !name.is_empty());
        let Some((id, name)) = parsed else {
            self.reply(chat, "Формат: /setname id Повне Імʼя").await?;
            return Ok(());
        };
        let Ok(principal) = id.parse::<u64>() else {
            self.reply(chat, "Невірний id").await?;
            return Ok(());
        };
        self.directory.set_full_name(principal, name).await?;
        self.reply(chat, "Імʼя оновлено").await?;
        Ok(())
    }

    async fn on_forward(
        &self,
        admin: &User,
        chat: ChatId,
        sender: Option<User>,
        text: Option<String>,
    ) -> Result<(), HandlerError> {
        let awaiting = self.gate.is_admin(admin.id) && self.directory.forward_window_open(admin.id).await?;
        if !awaiting {
            // a forwarded listing link is still a listing link
            if let Some(url) = text.filter(|t| is_url(t)) {
                return self.on_url(admin, chat, &url).await;
            }
            return Ok(());
        }
        let Some(sender) = sender else {
            self.reply(
                chat,
                "Не вдалося отримати ID з пересланого повідомлення (можливо, налаштування приватності).\n\
                 Попросіть користувача написати боту /start — тоді можна буде додати його.",
            )
            .await?;
            return Ok(());
        };
        self.directory.close_forward_window(admin.id).await?;
        self.gate.allow(sender.id).await?;
        self.remember(&sender).await;
        self.reply(chat, &format!("Додано {} до білого списку", sender.id)).await?;
        Ok(())
    }

    async fn on_admin_panel(
        &self,
        principal: u64,
        chat: ChatId,
        callback_id: &str,
        view: AdminView,
        message: Option<MessageRef>,
    ) -> Result<(), HandlerError> {
        if !self.gate.is_admin(principal) {
            return Ok(());
        }
        let text = match view {
            AdminView::Allowed => self.allowed_table().await?,
            AdminView::Stats => self.usage_report().await?,
        };
        match message {
            Some(message) => self.chat.edit_text(message, &text, None).await?,
            None => self.reply(chat, &text).await?,
        }
        self.chat.answer_callback(callback_id, None).await?;
        Ok(())
    }

    async fn allowed_table(&self) -> Result<String, StoreError> {
        let mut rows = Vec::new();
        for principal in self.gate.members().await? {
            rows.push(AllowedRow {
                principal,
                alias: self.directory.alias_of(principal).await?,
                full_name: self.directory.full_name_of(principal).await?,
            });
        }
        Ok(render::allowed_users(&rows))
    }

    async fn usage_report(&self) -> Result<String, StoreError> {
        let today = Utc::now().date_naive();
        let daily = self.stats.daily(today).await?;
        let weekly = self.stats.weekly(today).await?;
        let mut labels = HashMap::new();
        for (principal, _) in daily.iter().chain(weekly.iter()) {
            if labels.contains_key(principal) {
                continue;
            }
            if let Ok(id) = principal.parse::<u64>()
                && let Some(alias) = self.directory.alias_of(id).await?
            {
                labels.insert(principal.clone(), alias);
            }
        }
        Ok(render::usage_tables(
            &stats::rank(daily, &labels),
            &stats::rank(weekly, &labels),
        ))
    }
}

fn crop_status(percent: u8) -> String {
    format!("Поточна обрізка знизу: {percent}%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::FailMode,
        backup::BackupFile,
        chat::fake::{FakeChat, Sent},
        store::{WHITELIST_SET_KEY, memory::MemoryStore},
        test_support::{OLX_URL, orchestrator},
    };
    use serde_json::json;
    use std::collections::HashSet;

    const ADMIN: u64 = 1;

    struct Harness {
        bot: Bot,
        chat: Arc<FakeChat>,
        store: Arc<MemoryStore>,
        dedup: Arc<TaskDeduplicator>,
        _work: tempfile::TempDir,
    }

    fn harness(members: &[&str]) -> Harness {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_members(WHITELIST_SET_KEY, members));
        let chat = Arc::new(FakeChat::default());
        let gate = Arc::new(AccessGate::new(
            store.clone(),
            BackupFile::new(work.path().join("backup.json")),
            HashSet::from([ADMIN]),
            FailMode::Open,
        ));
        let dedup = Arc::new(TaskDeduplicator::new());
        let orchestrator = Arc::new(orchestrator(3, chat.clone(), store.clone(), &work.path().join("jobs")));
        let bot = Bot::new(
            chat.clone(),
            gate,
            dedup.clone(),
            orchestrator,
            PrincipalDirectory::new(store.clone()),
            UsageStats::new(store.clone()),
            15,
        );
        Harness {
            bot,
            chat,
            store,
            dedup,
            _work: work,
        }
    }

    fn text_event(from: u64, text: &str) -> Event {
        classify(
            serde_json::from_value(json!({
                "update_id": 1,
                "message": {
                    "message_id": 10,
                    "chat": { "id": from },
                    "from": { "id": from, "first_name": format!("User{from}") },
                    "text": text
                }
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn callback_event(from: u64, data: &str) -> Event {
        classify(
            serde_json::from_value(json!({
                "update_id": 2,
                "callback_query": {
                    "id": "cb",
                    "from": { "id": from, "first_name": "U" },
                    "data": data,
                    "message": { "message_id": 77, "chat": { "id": from } }
                }
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn command_parsing() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/Crop@listing_bot"), Some(Command::Crop));
        assert_eq!(
            Command::parse("/allow  42 "),
            Some(Command::Allow(vec!["42".into()]))
        );
        assert_eq!(
            Command::parse("/setname 42 Olena  Kovalenko"),
            Some(Command::SetName("42 Olena  Kovalenko".into()))
        );
        assert_eq!(Command::parse("/nope"), Some(Command::Unknown("nope".into())));
        assert_eq!(Command::parse("hello"), None);
    }

    #[test]
    fn classification_covers_trigger_kinds() {
        assert_eq!(
            text_event(5, OLX_URL).inbound,
            Inbound::Trigger(Trigger::UrlMessage { url: OLX_URL.into() })
        );
        assert_eq!(text_event(5, "/retry").inbound, Inbound::Command(Command::Retry));
        assert_eq!(text_event(5, "hi there").inbound, Inbound::Text);
        assert_eq!(
            callback_event(5, "set_crop:10").inbound,
            Inbound::Trigger(Trigger::CropSelection {
                callback_id: "cb".into(),
                value: Some(10),
                message: Some(MessageRef {
                    chat_id: 5,
                    message_id: 77
                }),
            })
        );
        assert!(matches!(
            callback_event(5, "set_crop:abc").inbound,
            Inbound::Trigger(Trigger::CropSelection { value: None, .. })
        ));
        assert!(matches!(
            callback_event(5, "admin:stats").inbound,
            Inbound::AdminPanel {
                view: AdminView::Stats,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_principal_is_told_access_is_restricted() {
        let h = harness(&[]);
        h.bot.dispatch(text_event(42, OLX_URL)).await;
        assert_eq!(h.chat.texts(), vec![MSG_DENIED.to_string()]);
        assert_eq!(h.dedup.in_flight(), 0);

        h.bot.dispatch(callback_event(42, "set_crop:5")).await;
        assert_eq!(h.chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn url_trigger_runs_a_job_for_allowed_principal() {
        let h = harness(&["42"]);
        h.bot.dispatch(text_event(42, OLX_URL)).await;
        let states = h.bot.wait_for_jobs().await;
        assert_eq!(states, vec![JobState::Completed { delivered: 2 }]);
        assert!(h.chat.texts().iter().any(|t| t.contains("Надіслано 2")));
        assert_eq!(h.bot.jobs_in_flight(), 0);
    }

    #[tokio::test]
    async fn second_trigger_while_in_flight_is_rejected() {
        let h = harness(&["42"]);
        let _held = h.dedup.acquire_slot(42).unwrap();
        h.bot.dispatch(text_event(42, OLX_URL)).await;
        assert_eq!(h.chat.texts(), vec![MSG_BUSY.to_string()]);
        assert!(h.bot.wait_for_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_site_is_rejected() {
        let h = harness(&["42"]);
        h.bot.dispatch(text_event(42, "https://example.com/listing/1")).await;
        assert_eq!(h.chat.texts(), vec![MSG_UNSUPPORTED.to_string()]);
    }

    #[tokio::test]
    async fn crop_selection_validates_and_persists() {
        let h = harness(&["42"]);
        h.bot.dispatch(callback_event(42, "set_crop:7")).await;
        h.bot.dispatch(callback_event(42, "set_crop:10")).await;

        let sent = h.chat.sent();
        assert!(sent.contains(&Sent::Callback {
            id: "cb".into(),
            text: Some("Недопустиме значення".into())
        }));
        assert!(sent.contains(&Sent::Edit {
            message_id: 77,
            text: "Поточна обрізка знизу: 10%".into()
        }));
        let profile = PrincipalDirectory::new(h.store.clone())
            .load_profile(42)
            .await
            .unwrap();
        assert_eq!(profile.crop_percentage, Some(10));
    }

    #[tokio::test]
    async fn retry_without_history() {
        let h = harness(&["42"]);
        h.bot.dispatch(text_event(42, "/retry")).await;
        assert_eq!(h.chat.texts(), vec![MSG_NO_HISTORY.to_string()]);
    }

    #[tokio::test]
    async fn admin_commands_are_ignored_for_members() {
        let h = harness(&["42"]);
        h.bot.dispatch(text_event(42, "/allow 99")).await;
        assert!(h.chat.sent().is_empty());
        assert!(!h.store.members(WHITELIST_SET_KEY).contains("99"));
    }

    #[tokio::test]
    async fn admin_allow_by_id_and_alias() {
        let h = harness(&[]);
        h.bot.dispatch(text_event(ADMIN, "/allow 99")).await;
        assert!(h.store.members(WHITELIST_SET_KEY).contains("99"));

        h.bot.dispatch(text_event(ADMIN, "/allow @olena")).await;
        assert!(h.chat.texts().last().unwrap().starts_with("Немає відповідності"));

        PrincipalDirectory::new(h.store.clone())
            .remember(55, Some("Olena"), None)
            .await
            .unwrap();
        h.bot.dispatch(text_event(ADMIN, "/allow @olena")).await;
        assert!(h.store.members(WHITELIST_SET_KEY).contains("55"));
        assert_eq!(h.chat.texts().last().unwrap(), "Додано 55 до білого списку");

        h.bot.dispatch(text_event(ADMIN, "/deny 99")).await;
        assert!(!h.store.members(WHITELIST_SET_KEY).contains("99"));
    }

    #[tokio::test]
    async fn forward_window_adds_sender() {
        let h = harness(&[]);
        h.bot.dispatch(text_event(ADMIN, "/allow_from_forward")).await;
        let forward: Update = serde_json::from_value(json!({
            "update_id": 3,
            "message": {
                "message_id": 11,
                "chat": { "id": ADMIN },
                "from": { "id": ADMIN, "first_name": "Admin" },
                "text": "hello",
                "forward_origin": {
                    "type": "user",
                    "date": 0,
                    "sender_user": { "id": 77, "first_name": "Ivan", "username": "ivan" }
                }
            }
        }))
        .unwrap();
        h.bot.dispatch(classify(forward).unwrap()).await;

        assert!(h.store.members(WHITELIST_SET_KEY).contains("77"));
        let directory = PrincipalDirectory::new(h.store.clone());
        assert_eq!(directory.resolve_alias("@ivan").await.unwrap(), Some(77));
        assert!(!directory.forward_window_open(ADMIN).await.unwrap());
    }

    #[tokio::test]
    async fn allowed_listing_shows_aliases() {
        let h = harness(&["42"]);
        PrincipalDirectory::new(h.store.clone())
            .remember(42, Some("olena"), Some("Olena K"))
            .await
            .unwrap();
        h.bot.dispatch(text_event(ADMIN, "/allowed")).await;
        let text = h.chat.texts().pop().unwrap();
        assert!(text.contains("<code>42</code>"));
        assert!(text.contains("@olena"));
        assert!(text.contains("Olena K"));
    }
}

//! Persona prompt templates and the values interpolated into them.

use crate::core::persona::PersonaProfile;
use crate::infrastructure::entities::{Message, Role};
use chrono::{DateTime, FixedOffset};
use minijinja::{Environment, Value, context};
use serde::Serialize;
use std::str::FromStr;

/// Which reply template is live. Only one is active per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptVariant {
    /// Current time, date and day are injected and may be quoted back.
    TimeAware,
    /// No clock values are injected; the model is told to decline time questions.
    TimeWithheld,
}

impl PromptVariant {
    fn reply_template(&self) -> &'static str {
        match self {
            PromptVariant::TimeAware => "reply_time_aware",
            PromptVariant::TimeWithheld => "reply_time_withheld",
        }
    }
}

impl FromStr for PromptVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time-aware" => Ok(PromptVariant::TimeAware),
            "time-withheld" => Ok(PromptVariant::TimeWithheld),
            other => Err(format!(
                "expected `time-aware` or `time-withheld`, got `{other}`"
            )),
        }
    }
}

/// Speaker names used when the transcript is flattened into the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleLabels {
    pub user: String,
    pub assistant: String,
}

impl Default for RoleLabels {
    fn default() -> Self {
        RoleLabels {
            user: "user".to_owned(),
            assistant: "assistant".to_owned(),
        }
    }
}

impl RoleLabels {
    pub fn label(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }
}

/// One `<label>: <content>` line per message, in transcript order.
pub fn serialize_history(messages: &[Message], labels: &RoleLabels) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", labels.label(m.role), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wall-clock values as the persona speaks about them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Moment {
    /// `HH:MM`, 24 hour.
    pub time: String,
    /// e.g. `27 June 2025`.
    pub date: String,
    /// e.g. `Friday`.
    pub day: String,
}

impl Moment {
    pub fn at(now: DateTime<FixedOffset>) -> Moment {
        Moment {
            time: now.format("%H:%M").to_string(),
            date: now.format("%-d %B %Y").to_string(),
            day: now.format("%A").to_string(),
        }
    }
}

/// Per-request template parameters. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptInput {
    pub message: Option<String>,
    pub chat_history: Option<String>,
    pub moment: Option<Moment>,
}

impl PromptInput {
    pub fn welcome(moment: Option<Moment>) -> PromptInput {
        PromptInput {
            moment,
            ..PromptInput::default()
        }
    }

    pub fn reply(message: String, chat_history: String, moment: Option<Moment>) -> PromptInput {
        PromptInput {
            message: Some(message),
            chat_history: Some(chat_history),
            moment,
        }
    }
}

pub struct PromptTemplates {
    env: Environment<'static>,
    variant: PromptVariant,
    wish_time: Option<String>,
    lookup_enabled: bool,
}

impl PromptTemplates {
    pub fn new(
        variant: PromptVariant,
        persona: &PersonaProfile,
        lookup_enabled: bool,
    ) -> Result<PromptTemplates, minijinja::Error> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("persona", include_str!("../../templates/persona.jinja"))?;
        env.add_template("task", include_str!("../../templates/task.jinja"))?;
        env.add_template("welcome", include_str!("../../templates/welcome.jinja"))?;
        env.add_template(
            "reply_time_aware",
            include_str!("../../templates/reply_time_aware.jinja"),
        )?;
        env.add_template(
            "reply_time_withheld",
            include_str!("../../templates/reply_time_withheld.jinja"),
        )?;
        env.add_global("persona", Value::from_serialize(persona));

        Ok(PromptTemplates {
            env,
            variant,
            wish_time: persona.wish_time.clone(),
            lookup_enabled: lookup_enabled && !persona.knowledge.is_empty(),
        })
    }

    /// Whether the persona's knowledge table is offered to the model.
    pub fn lookup_enabled(&self) -> bool {
        self.lookup_enabled
    }

    pub fn is_wish_moment(&self, moment: &Moment) -> bool {
        self.wish_time.as_deref() == Some(moment.time.as_str())
    }

    pub fn render_welcome(&self, input: &PromptInput) -> Result<String, minijinja::Error> {
        self.render("welcome", input)
    }

    pub fn render_reply(&self, input: &PromptInput) -> Result<String, minijinja::Error> {
        self.render(self.variant.reply_template(), input)
    }

    fn render(&self, name: &str, input: &PromptInput) -> Result<String, minijinja::Error> {
        // The withheld variant never sees the clock, even if one was passed.
        let moment = match self.variant {
            PromptVariant::TimeAware => input.moment.as_ref(),
            PromptVariant::TimeWithheld => None,
        };

        self.env.get_template(name)?.render(context! {
            message => input.message,
            chat_history => input.chat_history,
            time_aware => moment.is_some(),
            current_time => moment.map(|m| m.time.as_str()),
            current_date => moment.map(|m| m.date.as_str()),
            current_day => moment.map(|m| m.day.as_str()),
            wish_moment => moment.is_some_and(|m| self.is_wish_moment(m)),
            lookup_enabled => self.lookup_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::entities::MessageId;
    use chrono::{TimeZone, Utc};

    fn templates(variant: PromptVariant) -> PromptTemplates {
        PromptTemplates::new(variant, &PersonaProfile::builtin().unwrap(), false).unwrap()
    }

    fn moment(time: &str) -> Moment {
        Moment {
            time: time.to_owned(),
            date: "27 June 2025".to_owned(),
            day: "Friday".to_owned(),
        }
    }

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: MessageId::generate(),
            role,
            content: content.to_owned(),
            created_at: Utc::now(),
            persisted: false,
        }
    }

    #[test]
    fn test_history_keeps_order_and_labels() {
        let messages = vec![
            message(Role::Assistant, "Hi Katyayani"),
            message(Role::User, "hello"),
            message(Role::Assistant, "kya haal?"),
            message(Role::User, "sab badhiya"),
        ];

        let history = serialize_history(&messages, &RoleLabels::default());

        assert_eq!(
            history,
            "assistant: Hi Katyayani\nuser: hello\nassistant: kya haal?\nuser: sab badhiya"
        );
    }

    #[test]
    fn test_history_uses_configured_labels() {
        let labels = RoleLabels {
            user: "Katyayani".to_owned(),
            assistant: "Noor".to_owned(),
        };
        let messages = vec![message(Role::User, "hi"), message(Role::Assistant, "hey")];

        let history = serialize_history(&messages, &labels);
        let lines: Vec<_> = history.lines().collect();

        assert_eq!(lines, ["Katyayani: hi", "Noor: hey"]);
    }

    #[test]
    fn test_history_of_nothing_is_empty() {
        assert_eq!(serialize_history(&[], &RoleLabels::default()), "");
    }

    #[test]
    fn test_moment_formatting() {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        let now = ist.with_ymd_and_hms(2025, 6, 27, 9, 5, 0).unwrap();

        assert_eq!(
            Moment::at(now),
            Moment {
                time: "09:05".to_owned(),
                date: "27 June 2025".to_owned(),
                day: "Friday".to_owned(),
            }
        );
    }

    #[test]
    fn test_reply_embeds_time_and_history() {
        let input = PromptInput::reply(
            "aaj kya din hai?".to_owned(),
            "user: aaj kya din hai?".to_owned(),
            Some(moment("18:30")),
        );

        let prompt = templates(PromptVariant::TimeAware)
            .render_reply(&input)
            .unwrap();

        assert!(prompt.contains("You are Noor"));
        assert!(prompt.contains("Current Time: 18:30"));
        assert!(prompt.contains("Current Date: 27 June 2025"));
        assert!(prompt.contains("Current Day: Friday"));
        assert!(prompt.contains("Chat History:\nuser: aaj kya din hai?"));
        assert!(prompt.contains("Dal khichdi"));
        assert!(!prompt.contains("WISH MOMENT"));
    }

    #[test]
    fn test_wish_time_changes_the_reply_prompt() {
        let templates = templates(PromptVariant::TimeAware);
        let at = |time| {
            templates
                .render_reply(&PromptInput::reply(
                    "hi".to_owned(),
                    "user: hi".to_owned(),
                    Some(moment(time)),
                ))
                .unwrap()
        };

        let wish = at("11:11");
        let ordinary = at("11:12");

        assert_ne!(wish, ordinary);
        assert!(wish.contains("WISH MOMENT"));
        assert!(wish.contains("make your wish"));
        assert!(!ordinary.contains("WISH MOMENT"));
        assert!(!at("23:11").contains("WISH MOMENT"));
    }

    #[test]
    fn test_wish_time_changes_the_welcome_prompt() {
        let templates = templates(PromptVariant::TimeAware);

        let wish = templates
            .render_welcome(&PromptInput::welcome(Some(moment("11:11"))))
            .unwrap();
        let ordinary = templates
            .render_welcome(&PromptInput::welcome(Some(moment("07:45"))))
            .unwrap();

        assert!(wish.contains("WISH MOMENT"));
        assert!(!ordinary.contains("WISH MOMENT"));
        assert!(ordinary.contains("Current Time: 07:45"));
    }

    #[test]
    fn test_withheld_variant_never_shows_the_clock() {
        let input = PromptInput::reply(
            "time kya hua?".to_owned(),
            "user: time kya hua?".to_owned(),
            Some(moment("11:11")),
        );

        let prompt = templates(PromptVariant::TimeWithheld)
            .render_reply(&input)
            .unwrap();

        assert!(!prompt.contains("11:11 right now"));
        assert!(!prompt.contains("Current Time"));
        assert!(!prompt.contains("WISH MOMENT"));
        assert!(prompt.contains("can't check it right now"));
        assert!(prompt.contains("User Message:\ntime kya hua?"));
    }

    #[test]
    fn test_lookup_hint_follows_flag() {
        let persona = PersonaProfile::builtin().unwrap();
        let input = PromptInput::reply("hi".to_owned(), "user: hi".to_owned(), None);

        let with_lookup = PromptTemplates::new(PromptVariant::TimeAware, &persona, true).unwrap();
        let without = PromptTemplates::new(PromptVariant::TimeAware, &persona, false).unwrap();

        assert!(with_lookup.lookup_enabled());
        assert!(
            with_lookup
                .render_reply(&input)
                .unwrap()
                .contains("lookup_persona_fact")
        );
        assert!(!without.render_reply(&input).unwrap().contains("lookup_persona_fact"));
    }

    #[test]
    fn test_variant_names() {
        assert_eq!("time-aware".parse(), Ok(PromptVariant::TimeAware));
        assert_eq!("time-withheld".parse(), Ok(PromptVariant::TimeWithheld));
        assert!("always".parse::<PromptVariant>().is_err());
    }
}

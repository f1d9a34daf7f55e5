use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::BookingError;

// ── Fixed constants ──

/// Business opening hour (local time).
pub const BUSINESS_OPEN_HOUR: u32 = 9;
/// Business closing hour (local time). Candidate starts must be strictly before it.
pub const BUSINESS_CLOSE_HOUR: u32 = 20;
/// Step between two candidate slot starts.
pub const SLOT_STEP_MINUTES: i64 = 30;
/// Upper bound for every outbound HTTP call (calendar, Telegram).
pub const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Allowed pack sizes for paid coaching.
pub const ALLOWED_PACK_SIZES: [u32; 6] = [1, 2, 3, 4, 5, 8];

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: String,

    pub bot_token: String,
    pub telegram_api_base: String,
    pub operator_chat_id: i64,
    pub ticket_chat_id: i64,
    pub feedback_chat_id: Option<i64>,
    pub gateway_secret: String,
    pub coach_ids: Vec<i64>,

    pub calendar_id: String,
    pub calendar_token: String,
    pub calendar_api_base: String,

    pub timezone: Tz,
    pub free_duration_minutes: i64,
    pub paid_duration_minutes: i64,
    pub reminder_24h_enabled: bool,
    pub reminder_1h_enabled: bool,
    pub pack_expiry_days: i64,
    pub session_timeout: Duration,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, BookingError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup; `from_env` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BookingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = |key: &str| {
            get(key).ok_or_else(|| BookingError::Configuration(format!("{key} must be set")))
        };

        let timezone_name = get("TIMEZONE").unwrap_or_else(|| "Europe/Paris".into());
        let timezone = timezone_name.parse::<Tz>().map_err(|_| {
            BookingError::Configuration(format!("TIMEZONE: unknown zone '{timezone_name}'"))
        })?;

        let feedback_chat_id = match get("FEEDBACK_CHAT_ID") {
            Some(raw) => Some(parse_value::<i64>("FEEDBACK_CHAT_ID", &raw)?),
            None => None,
        };

        let coach_ids = match get("COACH_IDS") {
            Some(raw) => parse_id_list(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite:coachdesk.db?mode=rwc".into()),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: get("PORT").unwrap_or_else(|| "3000".into()),

            bot_token: required("BOT_TOKEN")?,
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".into()),
            operator_chat_id: parse_value("OPERATOR_CHAT_ID", &required("OPERATOR_CHAT_ID")?)?,
            ticket_chat_id: parse_value("TICKET_CHAT_ID", &required("TICKET_CHAT_ID")?)?,
            feedback_chat_id,
            gateway_secret: required("GATEWAY_SECRET")?,
            coach_ids,

            calendar_id: required("GOOGLE_CALENDAR_ID")?,
            calendar_token: get("GOOGLE_CALENDAR_TOKEN").unwrap_or_default(),
            calendar_api_base: get("GOOGLE_CALENDAR_API_BASE")
                .unwrap_or_else(|| "https://www.googleapis.com/calendar/v3".into()),

            timezone,
            free_duration_minutes: optional_value(&get, "FREE_COACHING_DURATION", 60)?,
            paid_duration_minutes: optional_value(&get, "PAID_COACHING_DURATION", 60)?,
            reminder_24h_enabled: optional_value(&get, "REMINDER_24H_ENABLED", true)?,
            reminder_1h_enabled: optional_value(&get, "REMINDER_1H_ENABLED", true)?,
            pack_expiry_days: optional_value(&get, "PACK_EXPIRY_DAYS", 60)?,
            session_timeout: Duration::from_secs(optional_value(&get, "SESSION_TIMEOUT_SECS", 300)?),
        })
    }

    /// Coaches are privileged: they bypass the ticket guard and may act on any booking.
    pub fn is_coach(&self, user_id: i64) -> bool {
        self.coach_ids.contains(&user_id)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, BookingError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| BookingError::Configuration(format!("{key}: invalid value '{raw}'")))
}

fn optional_value<T, G>(get: &G, key: &str, default: T) -> Result<T, BookingError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, BookingError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value::<i64>("COACH_IDS", s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("BOT_TOKEN", "123:abc"),
            ("OPERATOR_CHAT_ID", "-100200"),
            ("TICKET_CHAT_ID", "-100300"),
            ("GOOGLE_CALENDAR_ID", "coach@example.com"),
            ("GATEWAY_SECRET", "s3cret"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, BookingError> {
        Config::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.timezone, chrono_tz::Europe::Paris);
        assert_eq!(cfg.free_duration_minutes, 60);
        assert_eq!(cfg.paid_duration_minutes, 60);
        assert_eq!(cfg.pack_expiry_days, 60);
        assert_eq!(cfg.session_timeout, Duration::from_secs(300));
        assert!(cfg.reminder_24h_enabled && cfg.reminder_1h_enabled);
        assert!(cfg.coach_ids.is_empty());
        assert_eq!(cfg.feedback_chat_id, None);
        assert_eq!(cfg.port, "3000");
    }

    #[test]
    fn test_missing_required_is_configuration_error() {
        let mut env = base_env();
        env.remove("GOOGLE_CALENDAR_ID");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, BookingError::Configuration(msg) if msg.contains("GOOGLE_CALENDAR_ID")));
    }

    #[test]
    fn test_blank_required_counts_as_missing() {
        let mut env = base_env();
        env.insert("BOT_TOKEN", "   ");
        assert!(matches!(load(&env), Err(BookingError::Configuration(_))));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let mut env = base_env();
        env.insert("TIMEZONE", "Mars/Olympus");
        assert!(matches!(load(&env), Err(BookingError::Configuration(_))));
    }

    #[test]
    fn test_coach_ids_parsed() {
        let mut env = base_env();
        env.insert("COACH_IDS", "11, 22,,33");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.coach_ids, vec![11, 22, 33]);
        assert!(cfg.is_coach(22));
        assert!(!cfg.is_coach(44));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let mut env = base_env();
        env.insert("PACK_EXPIRY_DAYS", "soon");
        assert!(matches!(load(&env), Err(BookingError::Configuration(_))));
    }

    #[test]
    fn test_overrides() {
        let mut env = base_env();
        env.insert("PAID_COACHING_DURATION", "90");
        env.insert("REMINDER_1H_ENABLED", "false");
        env.insert("FEEDBACK_CHAT_ID", "-100999");
        env.insert("TIMEZONE", "America/New_York");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.paid_duration_minutes, 90);
        assert!(!cfg.reminder_1h_enabled);
        assert_eq!(cfg.feedback_chat_id, Some(-100999));
        assert_eq!(cfg.timezone, chrono_tz::America::New_York);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Draft,
    Active,
    Disabled,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Draft => "draft",
            AgentStatus::Active => "active",
            AgentStatus::Disabled => "disabled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(AgentStatus::Draft),
            "active" => Some(AgentStatus::Active),
            "disabled" => Some(AgentStatus::Disabled),
            _ => None,
        }
    }
}

/// Third-party platforms an agent can require a connected account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Gmail,
    Slack,
    Make,
    Zapier,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Gmail => "gmail",
            Platform::Slack => "slack",
            Platform::Make => "make",
            Platform::Zapier => "zapier",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "gmail" => Some(Platform::Gmail),
            "slack" => Some(Platform::Slack),
            "make" => Some(Platform::Make),
            "zapier" => Some(Platform::Zapier),
            _ => None,
        }
    }

    /// OAuth scopes a connected account of this platform must have been
    /// granted. Checked at connect time by the (external) OAuth flow; kept
    /// here so validation stays a table lookup instead of string matching.
    pub fn required_scopes(self) -> &'static [&'static str] {
        match self {
            Platform::Gmail => &["gmail.send", "gmail.readonly"],
            Platform::Slack => &["chat:write", "channels:read"],
            Platform::Make => &["scenarios:run"],
            Platform::Zapier => &["zap:trigger"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Connected,
    Expired,
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Connected => "connected",
            AccountStatus::Expired => "expired",
            AccountStatus::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "connected" => Some(AccountStatus::Connected),
            "expired" => Some(AccountStatus::Expired),
            "error" => Some(AccountStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub publisher_id: String,
    pub name: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub price: i64,
    pub status: AgentStatus,
    pub platform: Option<Platform>,
    pub input_schema: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectedAccountRecord {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub platform: Platform,
    pub status: AccountStatus,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

impl ConnectedAccountRecord {
    pub fn is_usable(&self) -> bool {
        self.status == AccountStatus::Connected
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub agent_id: String,
    pub user_id: String,
    pub account_id: Option<String>,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub credits_charged: i64,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationState::Held => "held",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "held" => Some(ReservationState::Held),
            "committed" => Some(ReservationState::Committed),
            "released" => Some(ReservationState::Released),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReservationRecord {
    pub token: String,
    pub user_id: String,
    pub execution_id: Option<String>,
    pub amount: i64,
    pub state: ReservationState,
    pub created_at: String,
    pub finalized_at: Option<String>,
}

/// A signed balance delta on some account (user or publisher), tied to an
/// execution for audit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreditTransactionRecord {
    pub id: i64,
    pub execution_id: Option<String>,
    pub account_id: String,
    pub amount: i64,
    pub reason: String,
    pub created_at: String,
}

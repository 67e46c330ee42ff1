use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(DealId);
id_newtype!(ApplicationId);
id_newtype!(MessageId);

/// The backend encodes user kinds as integers: 0 = advertiser, 1 = content-maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum UserType {
    Advertiser,
    ContentMaker,
}

impl TryFrom<i64> for UserType {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UserType::Advertiser),
            1 => Ok(UserType::ContentMaker),
            other => Err(format!("unknown user type code {other}")),
        }
    }
}

impl From<UserType> for i64 {
    fn from(value: UserType) -> Self {
        match value {
            UserType::Advertiser => 0,
            UserType::ContentMaker => 1,
        }
    }
}

macro_rules! status_enum {
    ($name:ident) => {
        /// Backend status codes: 0 = new, 1 = in progress, 2 = completed, 3 = canceled.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "i64", into = "i64")]
        pub enum $name {
            New,
            InProgress,
            Completed,
            Canceled,
        }

        impl $name {
            pub fn is_terminal(self) -> bool {
                matches!(self, $name::Completed | $name::Canceled)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = String;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                match value {
                    0 => Ok($name::New),
                    1 => Ok($name::InProgress),
                    2 => Ok($name::Completed),
                    3 => Ok($name::Canceled),
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), " code {}"),
                        other
                    )),
                }
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                match value {
                    $name::New => 0,
                    $name::InProgress => 1,
                    $name::Completed => 2,
                    $name::Canceled => 3,
                }
            }
        }
    };
}

status_enum!(DealStatus);
status_enum!(ApplicationStatus);

/// Access credentials plus the identity they belong to. Owned by the
/// storage layer; everything else reads a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: UserId,
    pub user_type: UserType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    #[serde(alias = "Id", alias = "dealId", alias = "DealId")]
    pub id: DealId,
    #[serde(alias = "ApplicationId")]
    pub application_id: ApplicationId,
    #[serde(alias = "AdvertiserId")]
    pub advertiser_id: UserId,
    /// The content-maker party.
    #[serde(alias = "PlatformId")]
    pub platform_id: UserId,
    #[serde(alias = "Status")]
    pub status: DealStatus,
    /// Denormalized from the linked application at load time; the
    /// application's cost stays the source of truth for settlement.
    #[serde(default, alias = "Cost")]
    pub cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(alias = "Id", alias = "applicationId", alias = "ApplicationId")]
    pub id: ApplicationId,
    #[serde(default, alias = "Description")]
    pub description: String,
    #[serde(alias = "Cost")]
    pub cost: i64,
    #[serde(alias = "Status")]
    pub status: ApplicationStatus,
    #[serde(default, alias = "UserId")]
    pub user_id: Option<UserId>,
}

/// The `/Auth/Me` and `/User/{id}` record. The backend is inconsistent
/// about field casing, hence the aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, alias = "Id")]
    pub id: Option<UserId>,
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Login")]
    pub login: String,
    #[serde(default, alias = "Email")]
    pub email: String,
    #[serde(default, alias = "Role")]
    pub role: i64,
    #[serde(rename = "type", alias = "Type")]
    pub user_type: UserType,
    #[serde(default, alias = "Balance")]
    pub balance: i64,
    #[serde(default, alias = "AvatarPath")]
    pub avatar_path: Option<String>,
    #[serde(default, alias = "Bio")]
    pub bio: Option<String>,
    #[serde(default, alias = "SocialLinks")]
    pub social_links: Vec<String>,
    #[serde(default, alias = "deleted_at", alias = "DeletedAt")]
    pub deleted_at: Option<String>,
}

impl UserProfile {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Delivery state of a locally originated message. History and live
/// messages from the hub are always `Confirmed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

/// Canonical chat message. Raw hub/REST payloads never leave the
/// reconciler; the rest of the client sees only this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub deal_id: DealId,
    pub text: String,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_own: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Pending,
    Settled,
    Failed,
}

impl IntentState {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentState::Pending => "pending",
            IntentState::Settled => "settled",
            IntentState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(IntentState::Pending),
            "settled" => Some(IntentState::Settled),
            "failed" => Some(IntentState::Failed),
            _ => None,
        }
    }
}

/// A recorded two-party balance move. Written before any funds move so a
/// partially failed settlement is detectable after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferIntent {
    pub intent_id: Uuid,
    pub deal_id: DealId,
    pub debit_user_id: UserId,
    pub credit_user_id: UserId,
    pub amount: i64,
    pub state: IntentState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

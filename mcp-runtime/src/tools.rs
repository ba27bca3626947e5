//! Tool Registry: the fixed catalog of CRM operations.
//!
//! Descriptors (name, description, input schema, auth flag) are plain data
//! and are what `tools/list` serializes. Execution is a `match` on
//! [`ToolKind`], so no handler can leak into a listing.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::args::{ToolError, arg_choice, bounded_u64, optional_string, required_string};
use crate::crm::{
    BlogStatus, CrmClient, MessageType, NewBlogPost, NewContact, OpportunityStatus,
    OutboundMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Authenticate,
    SessionStatus,
    SearchContacts,
    CreateContact,
    SendMessage,
    CreateBlogPost,
    GetOpportunities,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::Authenticate,
        ToolKind::SessionStatus,
        ToolKind::SearchContacts,
        ToolKind::CreateContact,
        ToolKind::SendMessage,
        ToolKind::CreateBlogPost,
        ToolKind::GetOpportunities,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Authenticate => "authenticate",
            ToolKind::SessionStatus => "session_status",
            ToolKind::SearchContacts => "search_contacts",
            ToolKind::CreateContact => "create_contact",
            ToolKind::SendMessage => "send_message",
            ToolKind::CreateBlogPost => "create_blog_post",
            ToolKind::GetOpportunities => "get_opportunities",
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, ToolKind::Authenticate | ToolKind::SessionStatus)
    }

    /// Prefix for upstream failure messages, e.g. "Failed to search contacts".
    /// `None` for the session tools, which never call the CRM.
    fn failure_context(self) -> Option<&'static str> {
        match self {
            ToolKind::SearchContacts => Some("Failed to search contacts"),
            ToolKind::CreateContact => Some("Failed to create contact"),
            ToolKind::SendMessage => Some("Failed to send message"),
            ToolKind::CreateBlogPost => Some("Failed to create blog post"),
            ToolKind::GetOpportunities => Some("Failed to get opportunities"),
            ToolKind::Authenticate | ToolKind::SessionStatus => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip)]
    pub requires_auth: bool,
    #[serde(skip)]
    pub kind: ToolKind,
}

impl ToolDescriptor {
    fn new(kind: ToolKind, description: &'static str, input_schema: Value) -> Self {
        Self {
            name: kind.name(),
            description,
            input_schema,
            requires_auth: kind.requires_auth(),
            kind,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate tool name '{0}'")]
    Duplicate(String),
}

/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(tools.len());
        for (position, tool) in tools.iter().enumerate() {
            if index.insert(tool.name, position).is_some() {
                return Err(RegistryError::Duplicate(tool.name.to_string()));
            }
        }
        Ok(Self { tools, index })
    }

    /// The gateway's catalog.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::new(ToolKind::ALL.into_iter().map(standard_descriptor).collect())
    }

    /// Exact, case-sensitive lookup.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|position| &self.tools[*position])
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn standard_descriptor(kind: ToolKind) -> ToolDescriptor {
    match kind {
        ToolKind::Authenticate => ToolDescriptor::new(
            kind,
            "Authenticate this session with your CRM API key and location (account) ID. Required once per session before any other CRM tool.",
            json!({
                "type": "object",
                "properties": {
                    "api_key": { "type": "string", "description": "Private integration API key (alias: apiKey)" },
                    "account_id": { "type": "string", "description": "Location / account ID (aliases: location_id, locationId)" }
                },
                "required": ["api_key", "account_id"]
            }),
        ),
        ToolKind::SessionStatus => ToolDescriptor::new(
            kind,
            "Report whether this session is authenticated and when it expires. Never reveals the API key.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolKind::SearchContacts => ToolDescriptor::new(
            kind,
            "Search for contacts in the CRM by name, email, phone or free text.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query (email, phone, name, etc.)" },
                    "phone": { "type": "string", "description": "Used as the query when 'query' is absent" },
                    "email": { "type": "string", "description": "Used as the query when 'query' and 'phone' are absent" },
                    "limit": { "type": "integer", "description": "Maximum number of results", "default": 10, "minimum": 1, "maximum": 100 }
                }
            }),
        ),
        ToolKind::CreateContact => ToolDescriptor::new(
            kind,
            "Create a new contact in the CRM.",
            json!({
                "type": "object",
                "properties": {
                    "first_name": { "type": "string", "description": "First name (alias: firstName)" },
                    "last_name": { "type": "string", "description": "Last name (alias: lastName)" },
                    "email": { "type": "string", "description": "Email address" },
                    "phone": { "type": "string", "description": "Phone number" }
                },
                "required": ["first_name", "phone"]
            }),
        ),
        ToolKind::SendMessage => ToolDescriptor::new(
            kind,
            "Send an SMS or email message to a contact.",
            json!({
                "type": "object",
                "properties": {
                    "contact_id": { "type": "string", "description": "ID of the contact to message (alias: contactId)" },
                    "message": { "type": "string", "description": "Message content" },
                    "type": { "type": "string", "enum": ["SMS", "Email"], "default": "SMS", "description": "Message type" },
                    "subject": { "type": "string", "description": "Email subject (required for Email)" }
                },
                "required": ["contact_id", "message"]
            }),
        ),
        ToolKind::CreateBlogPost => ToolDescriptor::new(
            kind,
            "Create a blog post.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Blog post title" },
                    "content": { "type": "string", "description": "Blog post content (HTML)" },
                    "status": { "type": "string", "enum": ["draft", "published"], "default": "draft", "description": "Publication status" }
                },
                "required": ["title", "content"]
            }),
        ),
        ToolKind::GetOpportunities => ToolDescriptor::new(
            kind,
            "List opportunities from the sales pipeline.",
            json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "description": "Maximum number of results", "default": 20, "minimum": 1, "maximum": 100 },
                    "status": { "type": "string", "enum": ["open", "won", "lost", "abandoned"], "default": "open", "description": "Opportunity status" }
                }
            }),
        ),
    }
}

pub const MAX_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateArgs {
    pub api_key: String,
    pub account_id: String,
}

impl AuthenticateArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(Self {
            api_key: required_string(args, &["api_key", "apiKey"])?,
            account_id: required_string(args, &["account_id", "location_id", "locationId"])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchContactsArgs {
    pub query: String,
    pub limit: u64,
}

impl SearchContactsArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        let query = match optional_string(args, &["query"])? {
            Some(query) => query,
            None => match optional_string(args, &["phone"])? {
                Some(phone) => phone,
                None => optional_string(args, &["email"])?.ok_or_else(|| {
                    ToolError::validation("query", "Provide 'query', 'phone' or 'email'")
                })?,
            },
        };
        Ok(Self {
            query,
            limit: bounded_u64(args, &["limit"], 10, 1, MAX_LIMIT)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContactArgs(pub NewContact);

impl CreateContactArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(Self(NewContact {
            first_name: required_string(args, &["first_name", "firstName"])?,
            last_name: optional_string(args, &["last_name", "lastName"])?,
            email: optional_string(args, &["email"])?,
            phone: required_string(args, &["phone"])?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageArgs(pub OutboundMessage);

impl SendMessageArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        let contact_id = required_string(args, &["contact_id", "contactId"])?;
        let message = required_string(args, &["message"])?;
        let kind = arg_choice(args, &["type"], MessageType::Sms, "SMS, Email", MessageType::parse)?;
        let subject = match kind {
            MessageType::Email => Some(required_string(args, &["subject"]).map_err(|err| {
                err.with_docs_hint("Email messages need a 'subject'.")
            })?),
            MessageType::Sms => None,
        };
        Ok(Self(OutboundMessage {
            kind,
            contact_id,
            message,
            subject,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBlogPostArgs(pub NewBlogPost);

impl CreateBlogPostArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(Self(NewBlogPost {
            title: required_string(args, &["title"])?,
            content: required_string(args, &["content"])?,
            status: arg_choice(
                args,
                &["status"],
                BlogStatus::Draft,
                "draft, published",
                BlogStatus::parse,
            )?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOpportunitiesArgs {
    pub status: OpportunityStatus,
    pub limit: u64,
}

impl GetOpportunitiesArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(Self {
            status: arg_choice(
                args,
                &["status"],
                OpportunityStatus::Open,
                "open, won, lost, abandoned",
                OpportunityStatus::parse,
            )?,
            limit: bounded_u64(args, &["limit"], 20, 1, MAX_LIMIT)?,
        })
    }
}

/// Runs an auth-required tool against the session's CRM client.
///
/// `Authenticate` and `SessionStatus` need the session manager rather than
/// a client and are handled by the dispatcher.
pub async fn execute(
    kind: ToolKind,
    client: &CrmClient,
    args: &Map<String, Value>,
) -> Result<Value, ToolError> {
    let upstream = |err: crate::crm::CrmError| {
        let mut tool_error = ToolError::from(err);
        if let Some(context) = kind.failure_context() {
            tool_error.message = format!("{context}: {}", tool_error.message);
        }
        tool_error
    };

    match kind {
        ToolKind::SearchContacts => {
            let args = SearchContactsArgs::parse(args)?;
            let body = client
                .search_contacts(&args.query, args.limit)
                .await
                .map_err(upstream)?;
            Ok(json!({
                "success": true,
                "contacts": array_or_empty(&body, "contacts"),
                "total": body.get("total").cloned().unwrap_or(json!(0))
            }))
        }
        ToolKind::CreateContact => {
            let CreateContactArgs(contact) = CreateContactArgs::parse(args)?;
            let body = client.create_contact(&contact).await.map_err(upstream)?;
            let name = match &contact.last_name {
                Some(last) => format!("{} {last}", contact.first_name),
                None => contact.first_name.clone(),
            };
            Ok(json!({
                "success": true,
                "contact": body.get("contact").cloned().unwrap_or(body),
                "message": format!("Contact created successfully: {name}")
            }))
        }
        ToolKind::SendMessage => {
            let SendMessageArgs(message) = SendMessageArgs::parse(args)?;
            let body = client.send_message(&message).await.map_err(upstream)?;
            Ok(json!({
                "success": true,
                "messageId": body.get("messageId").cloned().unwrap_or(Value::Null),
                "conversationId": body.get("conversationId").cloned().unwrap_or(Value::Null)
            }))
        }
        ToolKind::CreateBlogPost => {
            let CreateBlogPostArgs(post) = CreateBlogPostArgs::parse(args)?;
            let body = client.create_blog_post(&post).await.map_err(upstream)?;
            Ok(json!({
                "success": true,
                "blogId": body.get("id").cloned().unwrap_or(Value::Null),
                "url": body.get("url").cloned().unwrap_or(Value::Null)
            }))
        }
        ToolKind::GetOpportunities => {
            let args = GetOpportunitiesArgs::parse(args)?;
            let body = client
                .search_opportunities(args.status, args.limit)
                .await
                .map_err(upstream)?;
            Ok(json!({
                "success": true,
                "opportunities": array_or_empty(&body, "opportunities"),
                "total": body.get("total").cloned().unwrap_or(json!(0))
            }))
        }
        ToolKind::Authenticate | ToolKind::SessionStatus => Err(ToolError::new(
            "internal_error",
            format!("'{}' is not a CRM tool", kind.name()),
        )),
    }
}

fn array_or_empty(body: &Value, key: &str) -> Value {
    match body.get(key) {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => Value::Array(Vec::new()),
    }
}

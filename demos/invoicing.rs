//! Invoicing walkthrough: deciders, an upcasting codec, a latest-event
//! category, and a category source reacting to raised invoices.
//!
//! Run with: `cargo run --example invoicing`
//!
//! Uses an in-memory store unless `MESSAGE_DB_CONNECTION_STRING` is set, in
//! which case it runs against that MessageDB. Set `RUST_LOG=debug` to see
//! the engine's logs.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use eventfold_decider::{
    AccessStrategy, Aggregate, BoxError, Category, CategoryConfig, CategoryReader,
    CategorySource, Codec, Context, DeflateCodec, FileCheckpointStore, JsonCodec, LoadOption,
    MemoryCache, MemoryMessageStore, MessageDbConfig, MessageDbStore, MessageStore, SourceConfig,
    StreamId, StreamName, TimelineEvent, TypedCodec, Upcast, UpcastCodec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invoice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum InvoiceEvent {
    InvoiceRaised { payer_id: String, amount: u64 },
    PaymentReceived { amount: u64 },
}

#[derive(Debug, Clone, Default)]
struct Invoice {
    amount: Option<u64>,
    paid: u64,
}

impl Aggregate for Invoice {
    const CATEGORY: &'static str = "Invoice";
    type Event = InvoiceEvent;

    fn apply(mut self, event: &InvoiceEvent) -> Self {
        match event {
            InvoiceEvent::InvoiceRaised { amount, .. } => self.amount = Some(*amount),
            InvoiceEvent::PaymentReceived { amount } => self.paid += amount,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Invoice auto-emailer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EmailSent {
    email: String,
    payer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EmailSendingFailed {
    payer_id: String,
    reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum EmailEvent {
    EmailSent(EmailSent),
    EmailSendingFailed(EmailSendingFailed),
}

/// The outcome of the last attempt, if any.
#[derive(Debug, Clone, Default)]
struct InvoiceEmail(Option<EmailEvent>);

impl Aggregate for InvoiceEmail {
    const CATEGORY: &'static str = "InvoiceAutoEmail";
    type Event = EmailEvent;

    fn apply(self, event: &EmailEvent) -> Self {
        InvoiceEmail(Some(event.clone()))
    }
}

type EmailCodec = UpcastCodec<EmailEvent, JsonCodec>;

fn email_codec() -> EmailCodec {
    let upcast = Upcast::new()
        .validate("EmailSent", |data| {
            let sent: EmailSent = serde_json::from_value(data.unwrap_or(Value::Null))?;
            if !sent.email.contains('@') {
                return Err(format!("'{}' is not an email address", sent.email).into());
            }
            Ok(EmailEvent::EmailSent(sent))
        })
        .body("EmailSendingFailed", EmailEvent::EmailSendingFailed);
    UpcastCodec::new(JsonCodec, upcast)
}

#[derive(Debug, thiserror::Error)]
#[error("mailbox {0} rejected the message")]
struct Rejected(String);

/// Pretend mail transport: `.invalid` domains bounce.
async fn deliver(email: &str, amount: u64) -> Result<(), Rejected> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    if email.ends_with(".invalid") {
        return Err(Rejected(email.to_string()));
    }
    println!("  mail to {email}: please pay {amount} by tuesday");
    Ok(())
}

struct Emailer {
    emails: Category<InvoiceEmail, EmailCodec>,
    payers: HashMap<String, String>,
}

impl Emailer {
    async fn send_email(&self, invoice: StreamId, payer_id: &str, amount: u64) -> Result<(), BoxError> {
        let decider = self
            .emails
            .decider(invoice)?
            .with_context(Context::default().with_actor("invoice-auto-emailer"));
        decider
            .transact_async(|state: InvoiceEmail| {
                let email = self.payers.get(payer_id).cloned();
                let payer_id = payer_id.to_string();
                async move {
                    if let Some(EmailEvent::EmailSent(_)) = state.0 {
                        return Ok(((), Vec::new()));
                    }
                    let event = match email {
                        None => EmailEvent::EmailSendingFailed(EmailSendingFailed {
                            payer_id,
                            reason: "Payer not found".to_string(),
                        }),
                        Some(email) => match deliver(&email, amount).await {
                            Ok(()) => EmailEvent::EmailSent(EmailSent { email, payer_id }),
                            Err(e) => EmailEvent::EmailSendingFailed(EmailSendingFailed {
                                payer_id,
                                reason: e.to_string(),
                            }),
                        },
                    };
                    Ok::<_, Infallible>(((), vec![event]))
                }
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Contact preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Preferences {
    many_promotions: bool,
    little_promotions: bool,
    product_review: bool,
    quick_surveys: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum PreferencesEvent {
    ContactPreferencesChanged { email: String, preferences: Preferences },
}

impl Aggregate for Preferences {
    const CATEGORY: &'static str = "ContactPreferences";
    type Event = PreferencesEvent;

    fn apply(self, event: &PreferencesEvent) -> Self {
        match event {
            PreferencesEvent::ContactPreferencesChanged { preferences, .. } => *preferences,
        }
    }
}

fn update_preferences(email: &str, wanted: Preferences) -> impl FnMut(&Preferences) -> Vec<PreferencesEvent> {
    move |current| {
        if *current == wanted {
            return Vec::new();
        }
        vec![PreferencesEvent::ContactPreferencesChanged {
            email: email.to_string(),
            preferences: wanted,
        }]
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn open_store() -> Result<Arc<dyn MessageStore>, BoxError> {
    if std::env::var_os("MESSAGE_DB_CONNECTION_STRING").is_some() {
        let config = MessageDbConfig::from_env();
        return Ok(Arc::new(MessageDbStore::connect(&config).await?));
    }
    Ok(Arc::new(MemoryMessageStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = open_store().await?;
    let checkpoint_dir = tempfile::tempdir()?;

    let invoices: Category<Invoice, TypedCodec<InvoiceEvent>> =
        Category::new(Arc::clone(&store), TypedCodec::new())
            .with_cache(Arc::new(MemoryCache::<Invoice>::new()));
    let emailer = Arc::new(Emailer {
        emails: Category::new(Arc::clone(&store), email_codec()).with_config(CategoryConfig {
            access_strategy: AccessStrategy::LatestKnownEvent,
            ..CategoryConfig::default()
        }),
        payers: HashMap::from([
            ("payer-1".to_string(), "ada@example.com".to_string()),
            ("payer-2".to_string(), "bob@mail.invalid".to_string()),
        ]),
    });

    // Raise three invoices: a known payer, a bouncing mailbox, an unknown payer.
    let mut raised = Vec::new();
    for (payer_id, amount) in [("payer-1", 120), ("payer-2", 75), ("payer-3", 30)] {
        let id = StreamId::new(Uuid::new_v4().simple().to_string())?;
        invoices
            .decider(id.clone())?
            .transact(|state| match state.amount {
                Some(_) => Vec::new(),
                None => vec![InvoiceEvent::InvoiceRaised {
                    payer_id: payer_id.to_string(),
                    amount,
                }],
            })
            .await?;
        raised.push(id);
    }
    let first = invoices.decider(raised[0].clone())?;
    first
        .transact(|_| vec![InvoiceEvent::PaymentReceived { amount: 20 }])
        .await?;
    let outstanding = first
        .query(|s| s.amount.unwrap_or(0).saturating_sub(s.paid))
        .await?;
    println!("invoice {} outstanding: {outstanding}", raised[0]);

    // React to raised invoices by emailing the payer.
    let invoice_codec = TypedCodec::<InvoiceEvent>::new();
    let handler = {
        let emailer = Arc::clone(&emailer);
        move |stream: StreamName, events: Vec<TimelineEvent>| {
            let emailer = Arc::clone(&emailer);
            let decoded = events
                .first()
                .map(|event| invoice_codec.try_decode(event))
                .transpose();
            async move {
                if let Some(InvoiceEvent::InvoiceRaised { payer_id, amount }) = decoded?.flatten() {
                    emailer
                        .send_email(stream.stream_id().clone(), &payer_id, amount)
                        .await?;
                }
                Ok::<(), BoxError>(())
            }
        }
    };
    let source = CategorySource::new(
        CategoryReader::new(Arc::clone(&store)),
        Arc::new(FileCheckpointStore::new(checkpoint_dir.path())),
        handler,
        SourceConfig {
            tail_sleep: Duration::from_millis(100),
            ..SourceConfig::new(Invoice::CATEGORY, "invoice-auto-emailer")
        },
    )
    .start();

    let caught_up = tokio::time::timeout(Duration::from_secs(10), async {
        while !source.is_caught_up() && !source.is_finished() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    source.shutdown().await?;
    if caught_up.is_err() {
        return Err("invoice source did not catch up within 10s".into());
    }
    println!("emailer checkpoint: {}", source.position());

    for id in &raised {
        let outcome = emailer
            .emails
            .decider(id.clone())?
            .query(|s| s.0.clone())
            .await?;
        match outcome {
            Some(EmailEvent::EmailSent(sent)) => println!("invoice {id}: emailed {}", sent.email),
            Some(EmailEvent::EmailSendingFailed(failed)) => {
                println!("invoice {id}: failed for {}: {}", failed.payer_id, failed.reason)
            }
            None => println!("invoice {id}: not handled"),
        }
    }

    // Preferences are compressed at rest and derived from the latest event.
    let preferences: Category<Preferences, _> = Category::new(
        Arc::clone(&store),
        DeflateCodec::new(TypedCodec::<PreferencesEvent>::new()),
    )
    .with_cache(Arc::new(MemoryCache::<Preferences>::new().with_max_age(Duration::from_secs(30))))
    .with_config(CategoryConfig {
        access_strategy: AccessStrategy::LatestKnownEvent,
        ..CategoryConfig::default()
    });
    let email = "ada@example.com";
    let client = Uuid::new_v4().simple().to_string();
    let contact = preferences.decider(StreamId::compose(&["client", client.as_str()])?)?;
    let wanted = Preferences {
        little_promotions: true,
        quick_surveys: true,
        ..Preferences::default()
    };
    contact.transact(update_preferences(email, wanted)).await?;
    // Unchanged preferences write nothing.
    contact.transact(update_preferences(email, wanted)).await?;

    let fresh = contact.query(|p| *p).await?;
    let stale = contact.query_with(LoadOption::AllowStale, |p| *p).await?;
    println!("preferences for {email}: {fresh:?}");
    assert_eq!(fresh, wanted);
    assert_eq!(stale, wanted);

    Ok(())
}

use std::sync::Arc;

use lyceum_db::{Database, Directory};

use crate::contacts::ContactResolver;
use crate::conversations::ConversationStore;
use crate::error::ApiResult;
use crate::messages::MessageStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    pub contacts: ContactResolver,
    pub conversations: ConversationStore,
    pub messages: MessageStore,
}

impl AppStateInner {
    /// Wires the resolver and stores together. The database doubles as the
    /// directory reader.
    pub fn new(db: Arc<Database>, jwt_secret: String, token_ttl: chrono::Duration) -> Self {
        let directory: Arc<dyn Directory> = db.clone();
        let contacts = ContactResolver::new(directory.clone());
        let conversations = ConversationStore::new(db.clone(), directory, contacts.clone());
        let messages = MessageStore::new(db.clone(), conversations.clone());

        Self {
            db,
            jwt_secret,
            token_ttl,
            contacts,
            conversations,
            messages,
        }
    }
}

/// Runs blocking store work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

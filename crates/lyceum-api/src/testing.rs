use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use lyceum_db::Database;
use lyceum_types::models::{EnrollmentStatus, Role};

use crate::auth::Actor;
use crate::conversations::ConversationStore;
use crate::messages::MessageStore;
use crate::state::AppStateInner;

/// In-memory school shared by the store tests.
///
/// Admin A; teachers T (owns S1) and U (owns S3); students X and W enrolled
/// in S1, Y dropped from S1, Z enrolled in S3.
pub(crate) struct Fixture {
    pub db: Arc<Database>,
    pub conversations: ConversationStore,
    pub messages: MessageStore,
    pub s1: Uuid,
    users: HashMap<&'static str, Actor>,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());

        let mut users = HashMap::new();
        for (name, role) in [
            ("A", Role::Admin),
            ("T", Role::Teacher),
            ("U", Role::Teacher),
            ("X", Role::Student),
            ("W", Role::Student),
            ("Y", Role::Student),
            ("Z", Role::Student),
        ] {
            let id = Uuid::new_v4();
            db.create_user(id, &name.to_lowercase(), name, role, "unused", None)
                .unwrap();
            users.insert(name, Actor { id, role });
        }

        let s1 = Uuid::new_v4();
        let s3 = Uuid::new_v4();
        db.create_class_section(s1, "S1", users["T"].id).unwrap();
        db.create_class_section(s3, "S3", users["U"].id).unwrap();
        db.set_enrollment(users["X"].id, s1, EnrollmentStatus::Enrolled).unwrap();
        db.set_enrollment(users["W"].id, s1, EnrollmentStatus::Enrolled).unwrap();
        db.set_enrollment(users["Y"].id, s1, EnrollmentStatus::Dropped).unwrap();
        db.set_enrollment(users["Z"].id, s3, EnrollmentStatus::Enrolled).unwrap();

        let state = AppStateInner::new(db.clone(), "test-secret".into(), chrono::Duration::hours(1));
        Self {
            db,
            conversations: state.conversations.clone(),
            messages: state.messages.clone(),
            s1,
            users,
        }
    }

    pub fn actor(&self, name: &str) -> Actor {
        self.users[name]
    }

    pub fn id(&self, name: &str) -> Uuid {
        self.users[name].id
    }
}

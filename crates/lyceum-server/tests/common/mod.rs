#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use uuid::Uuid;

use lyceum_api::auth::{create_token, hash_password};
use lyceum_api::state::{AppState, AppStateInner};
use lyceum_db::Database;
use lyceum_gateway::dispatcher::Dispatcher;
use lyceum_server::build_router;
use lyceum_types::models::{EnrollmentStatus, Role};

pub const SECRET: &str = "integration-secret";
pub const PASSWORD: &str = "correct horse";

/// Teacher tom owns Algebra; sue and sam are enrolled, zed is not.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub dispatcher: Dispatcher,
    users: HashMap<&'static str, (Uuid, Role)>,
}

impl TestApp {
    pub fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut users = HashMap::new();

        for (name, role) in [
            ("tom", Role::Teacher),
            ("sue", Role::Student),
            ("sam", Role::Student),
            ("zed", Role::Student),
        ] {
            let id = Uuid::new_v4();
            // Only one real hash: Argon2 is slow in debug builds.
            let hash = if name == "tom" {
                hash_password(PASSWORD).unwrap()
            } else {
                "not-a-hash".to_string()
            };
            let display = format!("{}{}", name[..1].to_uppercase(), &name[1..]);
            db.create_user(id, name, &display, role, &hash, None).unwrap();
            users.insert(name, (id, role));
        }

        let algebra = Uuid::new_v4();
        db.create_class_section(algebra, "Algebra", users["tom"].0).unwrap();
        for student in ["sue", "sam"] {
            db.set_enrollment(users[student].0, algebra, EnrollmentStatus::Enrolled)
                .unwrap();
        }

        let state: AppState = Arc::new(AppStateInner::new(
            db,
            SECRET.to_string(),
            chrono::Duration::hours(1),
        ));
        let dispatcher = Dispatcher::new();
        let router = build_router(state.clone(), dispatcher.clone());

        Self {
            router,
            state,
            dispatcher,
            users,
        }
    }

    pub fn id(&self, name: &str) -> Uuid {
        self.users[name].0
    }

    pub fn token(&self, name: &str) -> String {
        let (id, role) = self.users[name];
        create_token(SECRET, chrono::Duration::hours(1), id, name, role).unwrap()
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Extension, Json, extract::State};
use uuid::Uuid;

use lyceum_db::Directory;
use lyceum_types::api::{Claims, Contacts};
use lyceum_types::models::{Role, User};

use crate::error::ApiResult;
use crate::state::{AppState, blocking};

/// Computes who an actor may message.
///
/// Evaluated against the live directory on every call: enrollment changes
/// must take effect immediately, so nothing is cached.
#[derive(Clone)]
pub struct ContactResolver {
    directory: Arc<dyn Directory>,
}

impl ContactResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Returns the contactable users for `actor_id` acting as `role`.
    /// An unknown actor gets an empty result rather than an error.
    pub fn resolve(&self, actor_id: Uuid, role: Role) -> anyhow::Result<Contacts> {
        if self.directory.user(actor_id)?.is_none() {
            return Ok(Contacts::default());
        }

        let mut set = ContactSet::new(actor_id);

        match role {
            Role::Admin => {
                for user in self.directory.users()? {
                    let bucket = match user.role {
                        Role::Admin => Bucket::Admins,
                        Role::Teacher => Bucket::Teachers,
                        Role::Student => Bucket::Students,
                    };
                    set.insert(bucket, user);
                }
            }

            Role::Teacher => {
                for admin in self.directory.users_with_role(Role::Admin)? {
                    set.insert(Bucket::Admins, admin);
                }
                for colleague in self.directory.users_with_role(Role::Teacher)? {
                    set.insert(Bucket::Classmates, colleague);
                }

                for section in self.directory.sections_taught_by(actor_id)? {
                    for student_id in self.directory.enrolled_student_ids(section.id)? {
                        if set.contains(student_id) {
                            continue;
                        }
                        if let Some(student) = self.directory.user(student_id)? {
                            if student.role == Role::Student {
                                set.insert(Bucket::Students, student);
                            }
                        }
                    }
                }
            }

            Role::Student => {
                for admin in self.directory.users_with_role(Role::Admin)? {
                    set.insert(Bucket::Admins, admin);
                }

                for class_id in self.directory.enrolled_section_ids(actor_id)? {
                    let Some(section) = self.directory.class_section(class_id)? else {
                        continue;
                    };

                    if !set.contains(section.teacher_id) {
                        if let Some(teacher) = self.directory.user(section.teacher_id)? {
                            set.insert(Bucket::Teachers, teacher);
                        }
                    }

                    for classmate_id in self.directory.enrolled_student_ids(class_id)? {
                        if set.contains(classmate_id) {
                            continue;
                        }
                        if let Some(classmate) = self.directory.user(classmate_id)? {
                            if classmate.role == Role::Student {
                                set.insert(Bucket::Classmates, classmate);
                            }
                        }
                    }
                }
            }
        }

        Ok(set.into_contacts())
    }
}

#[derive(Clone, Copy)]
enum Bucket {
    Admins,
    Teachers,
    Classmates,
    Students,
}

/// Accumulates contacts, deduplicated by user id and never including the actor.
struct ContactSet {
    actor_id: Uuid,
    users: BTreeMap<Uuid, (Bucket, User)>,
}

impl ContactSet {
    fn new(actor_id: Uuid) -> Self {
        Self {
            actor_id,
            users: BTreeMap::new(),
        }
    }

    fn contains(&self, user_id: Uuid) -> bool {
        user_id == self.actor_id || self.users.contains_key(&user_id)
    }

    /// First bucket wins when a user qualifies more than once.
    fn insert(&mut self, bucket: Bucket, user: User) {
        if self.contains(user.id) {
            return;
        }
        self.users.insert(user.id, (bucket, user));
    }

    fn into_contacts(self) -> Contacts {
        let mut contacts = Contacts::default();
        for (_, (bucket, user)) in self.users {
            match bucket {
                Bucket::Admins => contacts.admins.push(user),
                Bucket::Teachers => contacts.teachers.push(user),
                Bucket::Classmates => contacts.classmates.push(user),
                Bucket::Students => contacts.students.push(user),
            }
        }

        for list in [
            &mut contacts.admins,
            &mut contacts.teachers,
            &mut contacts.classmates,
            &mut contacts.students,
        ] {
            list.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        }
        contacts
    }
}

/// GET /recipients
pub async fn get_recipients(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Contacts>> {
    let resolver = state.contacts.clone();
    let contacts = blocking(move || Ok(resolver.resolve(claims.sub, claims.role)?)).await?;
    Ok(Json(contacts))
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use lyceum_db::models::{ConversationRow, NewConversation, ParticipantRow};
use lyceum_db::{Database, Directory, parse_id, parse_timestamp, timestamp};
use lyceum_types::api::{Claims, CreateConversationRequest};
use lyceum_types::models::{
    Conversation, ConversationKind, LastMessageSummary, Participant, Role, User,
};

use crate::auth::Actor;
use crate::contacts::ContactResolver;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

/// Owns conversation records and their participant sets. Participation is
/// the only access-control mechanism for everything inside a conversation.
#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Database>,
    directory: Arc<dyn Directory>,
    contacts: ContactResolver,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>, directory: Arc<dyn Directory>, contacts: ContactResolver) -> Self {
        Self {
            db,
            directory,
            contacts,
        }
    }

    /// Creates a conversation, or returns the existing active one for a
    /// direct pair. The boolean is true when a new record was written.
    pub fn create(
        &self,
        actor: Actor,
        req: CreateConversationRequest,
    ) -> ApiResult<(Conversation, bool)> {
        let created_at = timestamp(Utc::now());

        let (id, created) = match req.kind {
            ConversationKind::Direct => {
                let others = other_ids(actor.id, &req.participant_ids);
                if others.len() != 1 {
                    return Err(ApiError::invalid(
                        "direct conversations take exactly one other participant",
                    ));
                }
                let other = self.authorize_participants(actor, &others)?.remove(0);

                let mut pair = [actor.id.to_string(), other.id.to_string()];
                pair.sort();

                let new = NewConversation {
                    id: Uuid::new_v4().to_string(),
                    kind: ConversationKind::Direct.as_str().to_string(),
                    name: None,
                    class_id: None,
                    pair_key: Some(pair.join(":")),
                    participants: vec![
                        (actor.id.to_string(), actor.role.as_str().to_string()),
                        (other.id.to_string(), other.role.as_str().to_string()),
                    ],
                    created_at,
                };
                self.db.find_or_insert_direct(&new)?
            }

            ConversationKind::Group => {
                let name = required_name(req.name.as_deref())
                    .ok_or_else(|| ApiError::invalid("group conversations need a name"))?;
                let others = other_ids(actor.id, &req.participant_ids);
                if others.is_empty() {
                    return Err(ApiError::invalid(
                        "group conversations need at least one other participant",
                    ));
                }
                let members = self.authorize_participants(actor, &others)?;

                let mut participants = vec![(actor.id.to_string(), actor.role.as_str().to_string())];
                participants.extend(
                    members
                        .iter()
                        .map(|u| (u.id.to_string(), u.role.as_str().to_string())),
                );

                let new = NewConversation {
                    id: Uuid::new_v4().to_string(),
                    kind: ConversationKind::Group.as_str().to_string(),
                    name: Some(name),
                    class_id: None,
                    pair_key: None,
                    participants,
                    created_at,
                };
                self.db.insert_conversation(&new)?;
                (new.id, true)
            }

            ConversationKind::Class => {
                let class_id = req
                    .class_id
                    .ok_or_else(|| ApiError::invalid("class conversations need a classId"))?;
                let section = self
                    .directory
                    .class_section(class_id)?
                    .ok_or_else(|| ApiError::not_found(format!("class {}", class_id)))?;

                if actor.role != Role::Admin && section.teacher_id != actor.id {
                    return Err(ApiError::forbidden(
                        "only the owning teacher can open a class conversation",
                    ));
                }

                // Snapshot seeding: teacher plus whoever is enrolled right now.
                let mut participants = vec![(
                    section.teacher_id.to_string(),
                    Role::Teacher.as_str().to_string(),
                )];
                for student_id in self.directory.enrolled_student_ids(class_id)? {
                    participants.push((student_id.to_string(), Role::Student.as_str().to_string()));
                }
                if actor.id != section.teacher_id {
                    participants.push((actor.id.to_string(), actor.role.as_str().to_string()));
                }

                let name = required_name(req.name.as_deref()).unwrap_or_else(|| section.name.clone());
                let new = NewConversation {
                    id: Uuid::new_v4().to_string(),
                    kind: ConversationKind::Class.as_str().to_string(),
                    name: Some(name),
                    class_id: Some(class_id.to_string()),
                    pair_key: None,
                    participants,
                    created_at,
                };
                self.db.insert_conversation(&new)?;
                (new.id, true)
            }
        };

        if created {
            info!("{} created {} conversation {}", actor.id, req.kind, id);
        }

        let conversation = self.load(&id, actor.id)?;
        Ok((conversation, created))
    }

    /// Active conversations of `user_id`, most recently updated first.
    pub fn list(&self, user_id: Uuid) -> ApiResult<Vec<Conversation>> {
        let rows = self.db.list_conversations_for_user(&user_id.to_string())?;
        self.hydrate(rows, user_id)
    }

    pub fn get(&self, conversation_id: Uuid, requester_id: Uuid) -> ApiResult<Conversation> {
        self.require_participant(conversation_id, requester_id)?;
        self.load(&conversation_id.to_string(), requester_id)
    }

    /// Soft-disables a conversation. Participants and admins may do this;
    /// repeating it is a no-op.
    pub fn deactivate(&self, conversation_id: Uuid, actor: Actor) -> ApiResult<Conversation> {
        let id = conversation_id.to_string();
        if actor.role != Role::Admin {
            self.require_participant(conversation_id, actor.id)?;
        } else if self.db.get_conversation(&id)?.is_none() {
            return Err(ApiError::not_found(format!("conversation {}", conversation_id)));
        }

        if self.db.deactivate_conversation(&id, &timestamp(Utc::now()))? {
            info!("{} deactivated conversation {}", actor.id, conversation_id);
        }
        self.load(&id, actor.id)
    }

    /// Looks up a conversation and checks membership.
    /// `NotFound` if it does not exist, `Forbidden` if the user is not a participant.
    pub fn require_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ApiResult<ConversationRow> {
        let id = conversation_id.to_string();
        let row = self
            .db
            .get_conversation(&id)?
            .ok_or_else(|| ApiError::not_found(format!("conversation {}", conversation_id)))?;

        if !self.db.is_participant(&id, &user_id.to_string())? {
            return Err(ApiError::forbidden("not a participant of this conversation"));
        }
        Ok(row)
    }

    /// Adds students enrolled in the section since the class conversation was
    /// created (and the current teacher, if it changed). `create` never calls
    /// this, so class participant sets stay a snapshot unless a caller opts in.
    pub fn sync_class_participants(&self, conversation_id: Uuid) -> ApiResult<usize> {
        let id = conversation_id.to_string();
        let row = self
            .db
            .get_conversation(&id)?
            .ok_or_else(|| ApiError::not_found(format!("conversation {}", conversation_id)))?;

        let class_id = match (row.kind.as_str(), row.class_id.as_deref()) {
            ("class", Some(class_id)) => parse_id(class_id)?,
            _ => return Err(ApiError::invalid("not a class conversation")),
        };
        let section = self
            .directory
            .class_section(class_id)?
            .ok_or_else(|| ApiError::not_found(format!("class {}", class_id)))?;

        let mut participants = vec![(
            section.teacher_id.to_string(),
            Role::Teacher.as_str().to_string(),
        )];
        for student_id in self.directory.enrolled_student_ids(class_id)? {
            participants.push((student_id.to_string(), Role::Student.as_str().to_string()));
        }

        let added = self
            .db
            .add_participants(&id, &participants, &timestamp(Utc::now()))?;
        if added > 0 {
            info!("Synced {} new participants into class conversation {}", added, id);
        }
        Ok(added)
    }

    /// Every requested id must be a contact of the actor.
    /// Unknown users are `NotFound`; known but unreachable ones are `Forbidden`.
    fn authorize_participants(&self, actor: Actor, ids: &[Uuid]) -> ApiResult<Vec<User>> {
        let contacts = self.contacts.resolve(actor.id, actor.role)?;

        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = contacts.iter().find(|u| u.id == *id) {
                members.push(user.clone());
                continue;
            }
            if self.directory.user(*id)?.is_none() {
                return Err(ApiError::not_found(format!("user {}", id)));
            }
            warn!("{} tried to add non-contact {} to a conversation", actor.id, id);
            return Err(ApiError::forbidden(format!("user {} is not a permitted contact", id)));
        }
        Ok(members)
    }

    fn load(&self, id: &str, viewer: Uuid) -> ApiResult<Conversation> {
        let row = self
            .db
            .get_conversation(id)?
            .ok_or_else(|| ApiError::not_found(format!("conversation {}", id)))?;
        let mut hydrated = self.hydrate(vec![row], viewer)?;
        hydrated
            .pop()
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("conversation {} vanished", id)))
    }

    /// Attaches participants, display name/avatar and unread count for `viewer`.
    fn hydrate(&self, rows: Vec<ConversationRow>, viewer: Uuid) -> ApiResult<Vec<Conversation>> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let viewer_key = viewer.to_string();

        let mut participants_by_conv: HashMap<String, Vec<ParticipantRow>> = HashMap::new();
        for p in self.db.get_participants_for_conversations(&ids)? {
            participants_by_conv
                .entry(p.conversation_id.clone())
                .or_default()
                .push(p);
        }
        let unread = self.db.unread_counts(&viewer_key, &ids)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let participant_rows = participants_by_conv.remove(&row.id).unwrap_or_default();
            let kind: ConversationKind = row.kind.parse().map_err(anyhow::Error::from)?;

            let (display_name, avatar) = match kind {
                ConversationKind::Direct => participant_rows
                    .iter()
                    .find(|p| p.user_id != viewer_key)
                    .map(|p| (p.display_name.clone(), p.avatar_url.clone()))
                    .unwrap_or_else(|| ("unknown".to_string(), None)),
                ConversationKind::Class => (self.section_label(&row)?, None),
                ConversationKind::Group => (row.name.clone().unwrap_or_default(), None),
            };

            let participants = participant_rows
                .into_iter()
                .map(|p| {
                    Ok(Participant {
                        user_id: parse_id(&p.user_id)?,
                        role: p.role.parse().map_err(anyhow::Error::from)?,
                        display_name: p.display_name,
                        joined_at: parse_timestamp(&p.joined_at)?,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let last_message = match (&row.last_sender_id, &row.last_content, &row.last_sent_at) {
                (Some(sender), Some(content), Some(sent_at)) => Some(LastMessageSummary {
                    sender_id: parse_id(sender)?,
                    content: content.clone(),
                    sent_at: parse_timestamp(sent_at)?,
                }),
                _ => None,
            };

            out.push(Conversation {
                id: parse_id(&row.id)?,
                kind,
                class_id: row.class_id.as_deref().map(parse_id).transpose()?,
                unread_count: unread.get(&row.id).copied().unwrap_or(0),
                is_active: row.is_active,
                created_at: parse_timestamp(&row.created_at)?,
                updated_at: parse_timestamp(&row.updated_at)?,
                name: row.name,
                display_name,
                avatar,
                participants,
                last_message,
            });
        }
        Ok(out)
    }

    /// The section's current name; falls back to the stored name if the
    /// section is gone.
    fn section_label(&self, row: &ConversationRow) -> ApiResult<String> {
        if let Some(class_id) = row.class_id.as_deref() {
            if let Some(section) = self.directory.class_section(parse_id(class_id)?)? {
                return Ok(section.name);
            }
        }
        Ok(row.name.clone().unwrap_or_default())
    }
}

/// Requested ids minus the actor, deduplicated, in request order.
fn other_ids(actor_id: Uuid, requested: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .copied()
        .filter(|id| *id != actor_id && seen.insert(*id))
        .collect()
}

fn required_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

// -- Handlers --

/// GET /conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let store = state.conversations.clone();
    let conversations = blocking(move || store.list(claims.sub)).await?;
    Ok(Json(conversations))
}

/// GET /conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Conversation>> {
    let store = state.conversations.clone();
    let conversation = blocking(move || store.get(conversation_id, claims.sub)).await?;
    Ok(Json(conversation))
}

/// POST /conversations. 201 when created, 200 when an active direct
/// conversation for the pair already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let store = state.conversations.clone();
    let actor = Actor::from(&claims);
    let (conversation, created) = blocking(move || store.create(actor, req)).await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(conversation)))
}

/// POST /conversations/{id}/deactivate
pub async fn deactivate_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Conversation>> {
    let store = state.conversations.clone();
    let actor = Actor::from(&claims);
    let conversation = blocking(move || store.deactivate(conversation_id, actor)).await?;
    Ok(Json(conversation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use lyceum_types::models::EnrollmentStatus;

    fn direct(other: Uuid) -> CreateConversationRequest {
        CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![other],
            class_id: None,
            name: None,
        }
    }

    #[test]
    fn direct_create_is_idempotent_per_pair() {
        let f = Fixture::new();
        let (first, created) = f.conversations.create(f.actor("X"), direct(f.id("W"))).unwrap();
        assert!(created);
        let (again, created) = f.conversations.create(f.actor("W"), direct(f.id("X"))).unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);

        let ids: HashSet<Uuid> = again.participants.iter().map(|p| p.user_id).collect();
        assert_eq!(ids, HashSet::from([f.id("X"), f.id("W")]));
        assert_eq!(first.display_name, "W");
        assert_eq!(again.display_name, "X");
    }

    #[test]
    fn concurrent_direct_creates_yield_one_conversation() {
        let f = Fixture::new();
        let store = f.conversations.clone();
        let (x, w) = (f.actor("X"), f.actor("W"));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let (actor, other) = if i % 2 == 0 { (x, w.id) } else { (w, x.id) };
                    store.create(actor, direct(other)).unwrap().0.id
                })
            })
            .collect();

        let ids: HashSet<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        let direct_count = f
            .conversations
            .list(f.id("X"))
            .unwrap()
            .into_iter()
            .filter(|c| c.kind == ConversationKind::Direct)
            .count();
        assert_eq!(direct_count, 1);
    }

    #[test]
    fn direct_shape_is_validated() {
        let f = Fixture::new();
        let x = f.actor("X");

        let mut two = direct(f.id("W"));
        two.participant_ids.push(f.id("T"));
        assert!(matches!(f.conversations.create(x, two), Err(ApiError::InvalidInput(_))));

        assert!(matches!(
            f.conversations.create(x, direct(x.id)),
            Err(ApiError::InvalidInput(_))
        ));

        let mut self_twice = direct(x.id);
        self_twice.participant_ids.push(x.id);
        assert!(matches!(
            f.conversations.create(x, self_twice),
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[test]
    fn direct_accepts_actor_in_participant_list() {
        let f = Fixture::new();
        let x = f.actor("X");
        let (pair, _) = f.conversations.create(x, direct(f.id("W"))).unwrap();

        let mut with_self = direct(x.id);
        with_self.participant_ids.push(f.id("W"));
        let (again, created) = f.conversations.create(x, with_self).unwrap();
        assert!(!created);
        assert_eq!(again.id, pair.id);

        // Duplicates of the other participant still count as one.
        let mut repeated = direct(f.id("W"));
        repeated.participant_ids.extend([x.id, f.id("W")]);
        let (third, _) = f.conversations.create(x, repeated).unwrap();
        assert_eq!(third.id, pair.id);
    }

    #[test]
    fn participants_must_be_contacts() {
        let f = Fixture::new();
        // Y dropped S1, so X cannot reach Y.
        assert!(matches!(
            f.conversations.create(f.actor("X"), direct(f.id("Y"))),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            f.conversations.create(f.actor("X"), direct(Uuid::new_v4())),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn group_requires_name_and_members() {
        let f = Fixture::new();
        let t = f.actor("T");
        let mut req = CreateConversationRequest {
            kind: ConversationKind::Group,
            participant_ids: vec![f.id("X"), f.id("X"), f.id("W")],
            class_id: None,
            name: Some("  ".into()),
        };
        assert!(matches!(f.conversations.create(t, req), Err(ApiError::InvalidInput(_))));

        req = CreateConversationRequest {
            kind: ConversationKind::Group,
            participant_ids: vec![f.id("X"), f.id("X"), f.id("W")],
            class_id: None,
            name: Some("Lab partners".into()),
        };
        let (group, created) = f.conversations.create(t, req).unwrap();
        assert!(created);
        assert_eq!(group.participants.len(), 3);
        assert_eq!(group.display_name, "Lab partners");
    }

    #[test]
    fn class_conversation_is_a_snapshot() {
        let f = Fixture::new();
        let req = CreateConversationRequest {
            kind: ConversationKind::Class,
            participant_ids: vec![],
            class_id: Some(f.s1),
            name: None,
        };
        let (conv, _) = f.conversations.create(f.actor("T"), req).unwrap();

        let ids: HashSet<Uuid> = conv.participants.iter().map(|p| p.user_id).collect();
        assert_eq!(ids, HashSet::from([f.id("T"), f.id("X"), f.id("W")]));
        assert_eq!(conv.display_name, "S1");
        assert_eq!(conv.class_id, Some(f.s1));

        // Z enrolls later and is not added.
        f.db.set_enrollment(f.id("Z"), f.s1, EnrollmentStatus::Enrolled).unwrap();
        let reloaded = f.conversations.get(conv.id, f.id("T")).unwrap();
        assert_eq!(reloaded.participants.len(), 3);
        assert!(matches!(
            f.conversations.get(conv.id, f.id("Z")),
            Err(ApiError::Forbidden(_))
        ));

        // Until someone explicitly syncs.
        assert_eq!(f.conversations.sync_class_participants(conv.id).unwrap(), 1);
        assert_eq!(f.conversations.sync_class_participants(conv.id).unwrap(), 0);
        assert!(f.conversations.get(conv.id, f.id("Z")).is_ok());
    }

    #[test]
    fn class_conversation_requires_owner_or_admin() {
        let f = Fixture::new();
        let req = |class_id| CreateConversationRequest {
            kind: ConversationKind::Class,
            participant_ids: vec![],
            class_id,
            name: None,
        };

        assert!(matches!(
            f.conversations.create(f.actor("U"), req(Some(f.s1))),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            f.conversations.create(f.actor("T"), req(None)),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(matches!(
            f.conversations.create(f.actor("T"), req(Some(Uuid::new_v4()))),
            Err(ApiError::NotFound(_))
        ));

        let (conv, _) = f.conversations.create(f.actor("A"), req(Some(f.s1))).unwrap();
        assert!(conv.participants.iter().any(|p| p.user_id == f.id("A")));
        assert!(conv.participants.iter().any(|p| p.user_id == f.id("T")));
    }

    #[test]
    fn deactivated_direct_frees_the_pair() {
        let f = Fixture::new();
        let (first, _) = f.conversations.create(f.actor("X"), direct(f.id("W"))).unwrap();

        assert!(matches!(
            f.conversations.deactivate(first.id, f.actor("T")),
            Err(ApiError::Forbidden(_))
        ));
        let off = f.conversations.deactivate(first.id, f.actor("X")).unwrap();
        assert!(!off.is_active);
        assert!(f.conversations.list(f.id("X")).unwrap().is_empty());

        let (second, created) = f.conversations.create(f.actor("W"), direct(f.id("X"))).unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn list_orders_by_recent_activity() {
        let f = Fixture::new();
        let (with_w, _) = f.conversations.create(f.actor("X"), direct(f.id("W"))).unwrap();
        let (with_t, _) = f.conversations.create(f.actor("X"), direct(f.id("T"))).unwrap();

        let listed: Vec<Uuid> = f.conversations.list(f.id("X")).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(listed, vec![with_t.id, with_w.id]);

        f.messages.send(f.id("W"), with_w.id, "ping", Default::default()).unwrap();
        let listed = f.conversations.list(f.id("X")).unwrap();
        assert_eq!(listed[0].id, with_w.id);
        assert_eq!(listed[0].unread_count, 1);
        assert_eq!(listed[0].last_message.as_ref().unwrap().content, "ping");
        assert_eq!(listed[1].unread_count, 0);
    }
}

use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use lyceum_db::Database;
use lyceum_types::models::{EnrollmentStatus, Role};

/// Directory fixture loaded at startup. Stands in for the account and
/// enrollment systems, which own this data in a full deployment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub classes: Vec<SeedClass>,
    #[serde(default)]
    pub enrollments: Vec<SeedEnrollment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedUser {
    pub id: Option<Uuid>,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub password: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedClass {
    pub id: Option<Uuid>,
    pub name: String,
    /// Username of the owning teacher.
    pub teacher: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedEnrollment {
    /// Username
    pub student: String,
    /// Class name
    pub class: String,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users: usize,
    pub classes: usize,
    pub enrollments: usize,
}

pub fn load(db: &Database, path: &Path) -> anyhow::Result<SeedReport> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed: Seed = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed file {}", path.display()))?;
    let report = apply(db, &seed)?;
    info!(
        "Seeded {} users, {} classes, {} enrollments from {}",
        report.users,
        report.classes,
        report.enrollments,
        path.display()
    );
    Ok(report)
}

/// Applies the fixture. Existing usernames and class names are left alone;
/// enrollment statuses are overwritten. Counts only what was newly written.
pub fn apply(db: &Database, seed: &Seed) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for user in &seed.users {
        if db.get_user_by_username(&user.username)?.is_some() {
            debug!("Seed user '{}' already exists", user.username);
            continue;
        }
        let hash = lyceum_api::auth::hash_password(&user.password)?;
        let id = user.id.unwrap_or_else(Uuid::new_v4);
        if db.create_user(
            id,
            &user.username,
            &user.display_name,
            user.role,
            &hash,
            user.avatar_url.as_deref(),
        )? {
            report.users += 1;
        }
    }

    for class in &seed.classes {
        let teacher = db
            .get_user_by_username(&class.teacher)?
            .with_context(|| format!("class '{}' names unknown teacher '{}'", class.name, class.teacher))?;
        if teacher.role != Role::Teacher.as_str() {
            bail!("class '{}': '{}' is not a teacher", class.name, class.teacher);
        }
        let teacher_id = lyceum_db::parse_id(&teacher.id)?;
        if db.create_class_section(class.id.unwrap_or_else(Uuid::new_v4), &class.name, teacher_id)? {
            report.classes += 1;
        }
    }

    for enrollment in &seed.enrollments {
        let student = db
            .get_user_by_username(&enrollment.student)?
            .with_context(|| format!("enrollment names unknown student '{}'", enrollment.student))?;
        let class = db
            .get_class_section_by_name(&enrollment.class)?
            .with_context(|| format!("enrollment names unknown class '{}'", enrollment.class))?;
        db.set_enrollment(lyceum_db::parse_id(&student.id)?, class.id, enrollment.status)?;
        report.enrollments += 1;
    }

    Ok(report)
}

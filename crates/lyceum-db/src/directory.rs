//! Read-only view over users, class sections and enrollments.
//!
//! These tables belong to the account and enrollment subsystems. The
//! messaging core consumes them through [`Directory`]; the write helpers at
//! the bottom exist for seeding and tests.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use lyceum_types::models::{ClassSection, EnrollmentStatus, Role, User};

use crate::{Database, parse_id};
use crate::models::{ClassSectionRow, UserRow};

pub trait Directory: Send + Sync {
    fn user(&self, id: Uuid) -> Result<Option<User>>;

    fn users(&self) -> Result<Vec<User>>;

    fn users_with_role(&self, role: Role) -> Result<Vec<User>>;

    fn class_section(&self, id: Uuid) -> Result<Option<ClassSection>>;

    fn sections_taught_by(&self, teacher_id: Uuid) -> Result<Vec<ClassSection>>;

    /// Sections the student is currently `enrolled` in.
    fn enrolled_section_ids(&self, student_id: Uuid) -> Result<Vec<Uuid>>;

    /// Students currently `enrolled` in the section.
    fn enrolled_student_ids(&self, class_id: Uuid) -> Result<Vec<Uuid>>;
}

impl Directory for Database {
    fn user(&self, id: Uuid) -> Result<Option<User>> {
        self.get_user_by_id(&id.to_string())?
            .map(user_from_row)
            .transpose()
    }

    fn users(&self) -> Result<Vec<User>> {
        let rows = self.with_conn(|conn| {
            query_users(conn, "SELECT id, username, display_name, role, password, avatar_url FROM users ORDER BY display_name", rusqlite::params![])
        })?;
        rows.into_iter().map(user_from_row).collect()
    }

    fn users_with_role(&self, role: Role) -> Result<Vec<User>> {
        let rows = self.with_conn(|conn| {
            query_users(
                conn,
                "SELECT id, username, display_name, role, password, avatar_url FROM users WHERE role = ?1 ORDER BY display_name",
                [role.as_str()],
            )
        })?;
        rows.into_iter().map(user_from_row).collect()
    }

    fn class_section(&self, id: Uuid) -> Result<Option<ClassSection>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, teacher_id FROM class_sections WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(ClassSectionRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            teacher_id: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(section_from_row).transpose()
    }

    fn sections_taught_by(&self, teacher_id: Uuid) -> Result<Vec<ClassSection>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, teacher_id FROM class_sections WHERE teacher_id = ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([teacher_id.to_string()], |row| {
                    Ok(ClassSectionRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        teacher_id: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(section_from_row).collect()
    }

    fn enrolled_section_ids(&self, student_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = self.with_conn(|conn| {
            query_ids(
                conn,
                "SELECT class_id FROM enrollments WHERE student_id = ?1 AND status = 'enrolled'",
                &student_id.to_string(),
            )
        })?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    fn enrolled_student_ids(&self, class_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = self.with_conn(|conn| {
            query_ids(
                conn,
                "SELECT student_id FROM enrollments WHERE class_id = ?1 AND status = 'enrolled'",
                &class_id.to_string(),
            )
        })?;
        ids.iter().map(|id| parse_id(id)).collect()
    }
}

impl Database {
    // -- Lookups used by login --

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut rows = query_users(
                conn,
                "SELECT id, username, display_name, role, password, avatar_url FROM users WHERE username = ?1",
                [username],
            )?;
            Ok(rows.pop())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut rows = query_users(
                conn,
                "SELECT id, username, display_name, role, password, avatar_url FROM users WHERE id = ?1",
                [id],
            )?;
            Ok(rows.pop())
        })
    }

    // -- Writes standing in for the account/enrollment subsystems --

    /// Inserts a user; returns false if the username is already taken.
    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        display_name: &str,
        role: Role,
        password_hash: &str,
        avatar_url: Option<&str>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, display_name, role, password, avatar_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    username,
                    display_name,
                    role.as_str(),
                    password_hash,
                    avatar_url
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    /// Inserts a class section; returns false if the name is already taken.
    pub fn create_class_section(&self, id: Uuid, name: &str, teacher_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO class_sections (id, name, teacher_id) VALUES (?1, ?2, ?3)",
                (id.to_string(), name, teacher_id.to_string()),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_class_section_by_name(&self, name: &str) -> Result<Option<ClassSection>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, teacher_id FROM class_sections WHERE name = ?1",
                    [name],
                    |row| {
                        Ok(ClassSectionRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            teacher_id: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(section_from_row).transpose()
    }

    /// Upserts the enrollment status of a student in a section.
    pub fn set_enrollment(
        &self,
        student_id: Uuid,
        class_id: Uuid,
        status: EnrollmentStatus,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO enrollments (student_id, class_id, status, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT (student_id, class_id)
                 DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                (student_id.to_string(), class_id.to_string(), status.as_str()),
            )?;
            Ok(())
        })
    }
}

fn query_users<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<UserRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                role: row.get(3)?,
                password: row.get(4)?,
                avatar_url: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_ids(conn: &Connection, sql: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([key], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn user_from_row(row: UserRow) -> Result<User> {
    Ok(User {
        id: parse_id(&row.id)?,
        role: row
            .role
            .parse::<Role>()
            .with_context(|| format!("Corrupt role on user '{}'", row.id))?,
        username: row.username,
        display_name: row.display_name,
        avatar_url: row.avatar_url,
    })
}

fn section_from_row(row: ClassSectionRow) -> Result<ClassSection> {
    Ok(ClassSection {
        id: parse_id(&row.id)?,
        teacher_id: parse_id(&row.teacher_id)?,
        name: row.name,
    })
}

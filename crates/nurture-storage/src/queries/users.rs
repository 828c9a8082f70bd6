// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! User directory operations.

use nurture_core::NurtureError;
use rusqlite::{OptionalExtension, Row, params};

use crate::database::{Database, map_tr_err};
use crate::models::{User, format_ts, ts_col};

const USER_COLUMNS: &str =
    "user_id, display_name, email, verified_domain, channel_user_id, timezone, created_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        email: row.get(2)?,
        verified_domain: row.get(3)?,
        channel_user_id: row.get(4)?,
        timezone: row.get(5)?,
        created_at: ts_col(row, 6)?,
    })
}

/// Insert a user or update every field but `created_at`.
pub async fn upsert_user(db: &Database, user: &User) -> Result<(), NurtureError> {
    let user = user.clone();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, display_name, email, verified_domain,
                                    channel_user_id, timezone, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    email = excluded.email,
                    verified_domain = excluded.verified_domain,
                    channel_user_id = excluded.channel_user_id,
                    timezone = excluded.timezone",
                params![
                    user.user_id,
                    user.display_name,
                    user.email,
                    user.verified_domain,
                    user.channel_user_id,
                    user.timezone,
                    format_ts(&user.created_at),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

pub async fn get_user(db: &Database, user_id: &str) -> Result<Option<User>, NurtureError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
                row_to_user,
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

/// All users ordered by id.
pub async fn list_users(db: &Database) -> Result<Vec<User>, NurtureError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY user_id"
            ))?;
            let users = stmt
                .query_map([], row_to_user)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
        .map_err(map_tr_err)
}

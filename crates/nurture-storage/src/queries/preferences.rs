// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! User preference rows. The global row is stored with `sequence_type = '*'`.

use nurture_core::NurtureError;
use rusqlite::params;

use crate::database::{Database, map_tr_err};
use crate::models::{GLOBAL_PREFERENCE, UserPreference, format_ts, opt_ts_col, ts_col};

/// Every preference row of a user, global row first.
pub async fn get_preferences(
    db: &Database,
    user_id: &str,
) -> Result<Vec<UserPreference>, NurtureError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, sequence_type, enabled, frequency, time_preference, timezone,
                        opted_out_at, updated_at
                 FROM user_preferences WHERE user_id = ?1
                 ORDER BY sequence_type = '*' DESC, sequence_type",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    let sequence_type: String = row.get(1)?;
                    Ok(UserPreference {
                        user_id: row.get(0)?,
                        sequence_type: (sequence_type != GLOBAL_PREFERENCE).then_some(sequence_type),
                        enabled: row.get(2)?,
                        frequency: row.get(3)?,
                        time_preference: row.get(4)?,
                        timezone: row.get(5)?,
                        opted_out_at: opt_ts_col(row, 6)?,
                        updated_at: ts_col(row, 7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn upsert_preference(
    db: &Database,
    preference: &UserPreference,
) -> Result<(), NurtureError> {
    let p = preference.clone();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO user_preferences
                    (user_id, sequence_type, enabled, frequency, time_preference, timezone,
                     opted_out_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (user_id, sequence_type) DO UPDATE SET
                    enabled = excluded.enabled,
                    frequency = excluded.frequency,
                    time_preference = excluded.time_preference,
                    timezone = excluded.timezone,
                    opted_out_at = excluded.opted_out_at,
                    updated_at = excluded.updated_at",
                params![
                    p.user_id,
                    p.sequence_type.as_deref().unwrap_or(GLOBAL_PREFERENCE),
                    p.enabled,
                    p.frequency,
                    p.time_preference,
                    p.timezone,
                    p.opted_out_at.as_ref().map(format_ts),
                    format_ts(&p.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

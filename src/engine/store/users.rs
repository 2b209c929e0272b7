// ── Store: User Profiles ───────────────────────────────────────────────────

use rusqlite::params;

use super::Store;
use crate::atoms::error::EngineResult;
use crate::atoms::types::UserProfile;

impl UserProfile {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let channels_json: String = row.get(5)?;
        Ok(UserProfile {
            user_id: row.get(0)?,
            tenant_id: row.get(1)?,
            lightning_pubkey: row.get(2)?,
            daily_report_enabled: row.get::<_, i32>(3)? != 0,
            timezone: row.get(4)?,
            notification_channels: serde_json::from_str(&channels_json).unwrap_or_default(),
            apply_enabled: row.get::<_, i32>(6)? != 0,
        })
    }
}

const USER_COLUMNS: &str = "user_id, tenant_id, lightning_pubkey, daily_report_enabled,
                            timezone, notification_channels, apply_enabled";

impl Store {
    pub fn upsert_user(&self, u: &UserProfile) -> EngineResult<()> {
        let conn = self.lock();
        // ON CONFLICT(user_id) updates in place; a lightning_pubkey collision
        // with a DIFFERENT user still raises, preserving global uniqueness.
        conn.execute(
            &format!(
                "INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id) DO UPDATE SET
                     tenant_id = excluded.tenant_id,
                     lightning_pubkey = excluded.lightning_pubkey,
                     daily_report_enabled = excluded.daily_report_enabled,
                     timezone = excluded.timezone,
                     notification_channels = excluded.notification_channels,
                     apply_enabled = excluded.apply_enabled",
                USER_COLUMNS
            ),
            params![
                u.user_id,
                u.tenant_id,
                u.lightning_pubkey,
                u.daily_report_enabled as i32,
                u.timezone,
                serde_json::to_string(&u.notification_channels)?,
                u.apply_enabled as i32,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> EngineResult<Option<UserProfile>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS))?;
        let mut rows = stmt.query_map(params![user_id], UserProfile::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Users eligible for the daily trigger: enrolled AND carrying a pubkey.
    pub fn report_enabled_users(&self) -> EngineResult<Vec<UserProfile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users
             WHERE daily_report_enabled = 1 AND lightning_pubkey IS NOT NULL
             ORDER BY user_id",
            USER_COLUMNS
        ))?;
        let users = stmt
            .query_map([], UserProfile::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

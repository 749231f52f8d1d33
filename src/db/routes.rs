use super::models::{mask_key, Route, RouteInput};
use super::now_millis;
use crate::error::AppError;
use crate::modality::chat::Dialect;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Concurrent access to the `routes` table. Reads go straight to the pool;
/// writes are serialized.
#[derive(Clone)]
pub struct RouteStore {
    db: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl RouteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// First enabled route whose model matches exactly; lowest id wins.
    pub async fn resolve(&self, model: &str) -> Result<Route, AppError> {
        sqlx::query_as::<_, Route>(
            "SELECT * FROM routes WHERE model = ? AND enabled = 1 ORDER BY id ASC LIMIT 1",
        )
        .bind(model)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("route for model {}", model)))
    }

    pub async fn get(&self, id: i64) -> Result<Route, AppError> {
        sqlx::query_as::<_, Route>("SELECT * FROM routes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("route {}", id)))
    }

    pub async fn list(&self, group: Option<&str>) -> Result<Vec<Route>, AppError> {
        let routes = match group {
            Some(group) => {
                sqlx::query_as::<_, Route>(
                    "SELECT * FROM routes WHERE group_name = ? ORDER BY group_name ASC, name ASC",
                )
                .bind(group)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, Route>(
                    "SELECT * FROM routes ORDER BY group_name ASC, name ASC",
                )
                .fetch_all(&self.db)
                .await?
            }
        };
        Ok(routes)
    }

    /// Enabled routes of a group in ascending id order.
    pub async fn group_members(&self, group: &str) -> Result<Vec<Route>, AppError> {
        Ok(sqlx::query_as::<_, Route>(
            "SELECT * FROM routes WHERE group_name = ? AND enabled = 1 ORDER BY id ASC",
        )
        .bind(group)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn enabled_models(&self) -> Result<Vec<String>, AppError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT model FROM routes WHERE enabled = 1 GROUP BY model ORDER BY MIN(id) ASC",
        )
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn upsert(&self, input: RouteInput) -> Result<i64, AppError> {
        let input = validate(input)?;
        let dialect = Dialect::from_str_loose(&input.dialect)
            .ok_or_else(|| AppError::Validation(format!("Unsupported dialect: {}", input.dialect)))?;
        let api_url = input.api_url.trim().trim_end_matches('/').to_string();
        let group = input.group.as_deref().map(str::trim).unwrap_or("").to_string();
        let now = now_millis();

        let _guard = self.write_lock.lock().await;

        match input.id {
            Some(id) => {
                // an empty or masked key keeps the stored secret
                let stored: Option<String> =
                    sqlx::query_scalar("SELECT api_key FROM routes WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&self.db)
                        .await?;
                let Some(stored) = stored else {
                    return Err(AppError::NotFound(format!("route {}", id)));
                };
                let api_key = if input.api_key.is_empty() || input.api_key == mask_key(&stored) {
                    stored
                } else {
                    input.api_key.clone()
                };

                let result = sqlx::query(
                    "UPDATE routes SET name = ?, model = ?, api_url = ?, api_key = ?, group_name = ?, dialect = ?, enabled = ?, pass_client_model = ?, updated_at = ? WHERE id = ?",
                )
                .bind(input.name.trim())
                .bind(input.model.trim())
                .bind(&api_url)
                .bind(&api_key)
                .bind(&group)
                .bind(dialect)
                .bind(input.enabled)
                .bind(input.pass_client_model)
                .bind(now)
                .bind(id)
                .execute(&self.db)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(AppError::NotFound(format!("route {}", id)));
                }
                log::info!("Updated route {} ({})", id, input.name.trim());
                Ok(id)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO routes (name, model, api_url, api_key, group_name, dialect, enabled, pass_client_model, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(input.name.trim())
                .bind(input.model.trim())
                .bind(&api_url)
                .bind(&input.api_key)
                .bind(&group)
                .bind(dialect)
                .bind(input.enabled)
                .bind(input.pass_client_model)
                .bind(now)
                .bind(now)
                .execute(&self.db)
                .await?;

                let id = result.last_insert_rowid();
                log::info!("Created route {} ({})", id, input.name.trim());
                Ok(id)
            }
        }
    }

    pub async fn toggle(&self, id: i64, enabled: bool) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE routes SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(now_millis())
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("route {}", id)));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM routes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("route {}", id)));
        }
        log::info!("Deleted route {}", id);
        Ok(())
    }
}

fn validate(input: RouteInput) -> Result<RouteInput, AppError> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if input.model.trim().is_empty() {
        return Err(AppError::Validation("model must not be empty".into()));
    }
    if input.api_url.trim().trim_end_matches('/').is_empty() {
        return Err(AppError::Validation("api_url must not be empty".into()));
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_pool;

    fn route_input(name: &str, model: &str, dialect: &str) -> RouteInput {
        RouteInput {
            id: None,
            name: name.to_string(),
            model: model.to_string(),
            api_url: "https://api.example.com/".to_string(),
            api_key: "sk-test".to_string(),
            group: None,
            dialect: dialect.to_string(),
            enabled: true,
            pass_client_model: false,
        }
    }

    async fn store() -> (tempfile::TempDir, RouteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&dir.path().join("test.db")).await.unwrap();
        (dir, RouteStore::new(pool))
    }

    #[tokio::test]
    async fn upsert_trims_url_and_resolves() {
        let (_dir, store) = store().await;
        let id = store.upsert(route_input("main", "gpt-4o", "openai")).await.unwrap();

        let route = store.resolve("gpt-4o").await.unwrap();
        assert_eq!(route.id, id);
        assert_eq!(route.api_url, "https://api.example.com");
        assert_eq!(route.dialect, Dialect::Openai);
        assert!(matches!(store.resolve("GPT-4O").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn upsert_rejects_invalid_input() {
        let (_dir, store) = store().await;
        let mut input = route_input("", "gpt-4o", "openai");
        assert!(matches!(store.upsert(input.clone()).await, Err(AppError::Validation(_))));

        input.name = "x".into();
        input.dialect = "bedrock".into();
        assert!(matches!(store.upsert(input.clone()).await, Err(AppError::Validation(_))));

        input.dialect = "claude".into();
        input.api_url = "/".into();
        assert!(matches!(store.upsert(input).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn resolve_prefers_lowest_enabled_id() {
        let (_dir, store) = store().await;
        let first = store.upsert(route_input("a", "gpt-4o", "openai")).await.unwrap();
        let second = store.upsert(route_input("b", "gpt-4o", "claude")).await.unwrap();

        assert_eq!(store.resolve("gpt-4o").await.unwrap().id, first);
        store.toggle(first, false).await.unwrap();
        assert_eq!(store.resolve("gpt-4o").await.unwrap().id, second);
        store.delete(second).await.unwrap();
        assert!(store.resolve("gpt-4o").await.is_err());
    }

    #[tokio::test]
    async fn list_orders_by_group_then_name() {
        let (_dir, store) = store().await;
        let mut z = route_input("zeta", "m1", "openai");
        z.group = Some("a".into());
        let mut b = route_input("beta", "m2", "openai");
        b.group = Some("b".into());
        let mut a = route_input("alpha", "m3", "gemini");
        a.group = Some("b".into());
        store.upsert(b).await.unwrap();
        store.upsert(a).await.unwrap();
        store.upsert(z).await.unwrap();

        let names: Vec<String> = store.list(None).await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "beta"]);

        let group_b = store.list(Some("b")).await.unwrap();
        assert_eq!(group_b.len(), 2);
    }

    #[tokio::test]
    async fn update_and_missing_ids() {
        let (_dir, store) = store().await;
        let id = store.upsert(route_input("a", "gpt-4o", "openai")).await.unwrap();

        let mut input = route_input("renamed", "gpt-4o-mini", "cursor");
        input.id = Some(id);
        store.upsert(input).await.unwrap();
        let route = store.get(id).await.unwrap();
        assert_eq!(route.name, "renamed");
        assert_eq!(route.dialect, Dialect::Cursor);

        assert!(matches!(store.toggle(999, true).await, Err(AppError::NotFound(_))));
        assert!(matches!(store.delete(999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_with_masked_or_missing_key_keeps_secret() {
        let (_dir, store) = store().await;
        let mut input = route_input("a", "gpt-4o", "openai");
        input.api_key = "sk-secret-123456".into();
        let id = store.upsert(input).await.unwrap();

        let echoed = store.get(id).await.unwrap().masked();
        let mut edit = route_input("renamed", &echoed.model, "openai");
        edit.id = Some(id);
        edit.api_key = echoed.api_key.clone();
        store.upsert(edit.clone()).await.unwrap();
        let route = store.get(id).await.unwrap();
        assert_eq!(route.name, "renamed");
        assert_eq!(route.api_key, "sk-secret-123456");

        edit.api_key = String::new();
        store.upsert(edit.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().api_key, "sk-secret-123456");

        edit.api_key = "sk-rotated".into();
        store.upsert(edit).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().api_key, "sk-rotated");
    }
}

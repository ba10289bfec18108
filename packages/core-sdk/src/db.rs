use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::config::ProviderSecrets;
use crate::error::StoreError;
use crate::models::{Credential, CredentialPatch, NewCredential, ProviderKind};

type Result<T> = std::result::Result<T, StoreError>;

/** \brief 环境变量种子凭据写入 description 的标记。 */
pub const ENV_SEED_MARKER: &str = "[env-seed]";

const COLUMNS: &str = "id, provider, secret, description, active, usage_count, usage_limit, last_used_at, created_at, updated_at";

/**
 * \brief 凭据表的持久化入口。
 * \details 每次操作独立打开连接并在阻塞线程池中执行；写入由 SQLite 按语句/事务串行化。
 */
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: Arc<PathBuf>,
}

/**
 * \brief 启动种子写入的结果汇总。
 */
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeedReport {
    pub seeded: Vec<ProviderKind>,
    pub already_present: Vec<ProviderKind>,
    pub failed: Vec<(ProviderKind, String)>,
}

impl CredentialStore {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: Arc::new(path.as_ref().to_path_buf()),
        };
        store.run(|conn| migrate(conn)).await?;
        info!(path = %store.path.display(), "credential store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut conn = open_db(&path)?;
            action(&mut conn)
        })
        .await?
    }

    pub async fn add(&self, new: NewCredential) -> Result<Credential> {
        self.run(move |conn| insert_credential(conn, &new)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Credential>> {
        let id = id.to_string();
        self.run(move |conn| get_credential(conn, &id)).await
    }

    pub async fn list_all(&self) -> Result<Vec<Credential>> {
        self.run(|conn| list_credentials(conn, None, false)).await
    }

    pub async fn list_by_provider(&self, provider: ProviderKind) -> Result<Vec<Credential>> {
        self.run(move |conn| list_credentials(conn, Some(provider), false))
            .await
    }

    /**
     * \brief 列出指定服务的启用凭据，按创建时间倒序。
     */
    pub async fn list_active_by_provider(&self, provider: ProviderKind) -> Result<Vec<Credential>> {
        self.run(move |conn| list_credentials(conn, Some(provider), true))
            .await
    }

    pub async fn update(&self, id: &str, patch: CredentialPatch) -> Result<Credential> {
        let id = id.to_string();
        self.run(move |conn| update_credential(conn, &id, &patch))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| delete_credential(conn, &id)).await
    }

    /**
     * \brief 原子地累加用量、刷新最近使用时间，并在达到上限时停用。
     * \return 凭据已停用/已耗尽/不存在时返回 None。
     */
    pub async fn record_usage(&self, id: &str) -> Result<Option<Credential>> {
        let id = id.to_string();
        self.run(move |conn| record_usage(conn, &id)).await
    }

    /**
     * \brief 为每个提供了密钥的服务写入且仅写入一条种子凭据。
     * \details 失败只记录日志，不中断启动。
     */
    pub async fn seed_from_config(&self, secrets: &ProviderSecrets) -> SeedReport {
        let mut report = SeedReport::default();
        for (kind, secret) in secrets.iter() {
            let secret = secret.to_string();
            match self
                .run(move |conn| seed_env_credential(conn, kind, &secret))
                .await
            {
                Ok(true) => {
                    info!(provider = %kind, "seeded credential from {}", kind.env_key());
                    report.seeded.push(kind);
                }
                Ok(false) => {
                    debug!(provider = %kind, "env credential already seeded");
                    report.already_present.push(kind);
                }
                Err(e) => {
                    error!(provider = %kind, error = %e, "seeding env credential failed");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        report
    }
}

/**
 * \brief 打开数据库文件。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            secret TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            usage_count INTEGER NOT NULL DEFAULT 0,
            usage_limit INTEGER,
            last_used_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_credentials_provider_active
            ON credentials (provider, active, created_at DESC);
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 数据库原始行，转换为 Credential 时校验。
 */
struct RawCredential {
    id: String,
    provider: String,
    secret: String,
    description: String,
    active: bool,
    usage_count: i64,
    usage_limit: Option<i64>,
    last_used_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCredential> {
    Ok(RawCredential {
        id: row.get(0)?,
        provider: row.get(1)?,
        secret: row.get(2)?,
        description: row.get(3)?,
        active: row.get(4)?,
        usage_count: row.get(5)?,
        usage_limit: row.get(6)?,
        last_used_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl TryFrom<RawCredential> for Credential {
    type Error = StoreError;

    fn try_from(raw: RawCredential) -> Result<Self> {
        let provider = raw
            .provider
            .parse::<ProviderKind>()
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", raw.id, e)))?;
        let count = |v: i64, field: &str| {
            u64::try_from(v)
                .map_err(|_| StoreError::Corrupt(format!("{}: negative {}", raw.id, field)))
        };
        Ok(Credential {
            usage_count: count(raw.usage_count, "usage_count")?,
            usage_limit: raw
                .usage_limit
                .map(|v| count(v, "usage_limit"))
                .transpose()?,
            last_used_at: raw.last_used_at.map(from_nanos).transpose()?,
            created_at: from_nanos(raw.created_at)?,
            updated_at: from_nanos(raw.updated_at)?,
            id: raw.id,
            provider,
            secret: raw.secret,
            description: raw.description,
            active: raw.active,
        })
    }
}

fn now_nanos() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(v: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(v))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {}: {}", v, e)))
}

fn to_sql_count(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/**
 * \brief 新增凭据；上限为 0 时直接以停用状态写入。
 */
pub fn insert_credential(conn: &Connection, new: &NewCredential) -> Result<Credential> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_nanos();
    let active = !matches!(new.usage_limit, Some(0));
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO credentials (id, provider, secret, description, active, usage_count, usage_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
            params![
                id,
                new.provider.as_str(),
                new.secret,
                new.description,
                active,
                new.usage_limit.map(to_sql_count),
                now
            ],
        )
    })?;
    get_credential(conn, &id)?.ok_or(StoreError::NotFound(id))
}

/**
 * \brief 按 ID 获取凭据。
 */
pub fn get_credential(conn: &Connection, id: &str) -> Result<Option<Credential>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM credentials WHERE id=?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()?;
    raw.map(Credential::try_from).transpose()
}

/**
 * \brief 列出凭据，最新创建的在前。
 */
pub fn list_credentials(
    conn: &Connection,
    provider: Option<ProviderKind>,
    active_only: bool,
) -> Result<Vec<Credential>> {
    let mut sql = format!("SELECT {} FROM credentials WHERE 1=1", COLUMNS);
    if provider.is_some() {
        sql.push_str(" AND provider=?1");
    }
    if active_only {
        sql.push_str(" AND active=1");
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = match provider {
        Some(p) => stmt
            .query_map(params![p.as_str()], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    rows.into_iter().map(Credential::try_from).collect()
}

/**
 * \brief 部分更新凭据，并重新套用“达到上限即停用”的约束。
 * \details 上限被调低到当前用量以下时，用量截断为上限。
 */
pub fn update_credential(
    conn: &mut Connection,
    id: &str,
    patch: &CredentialPatch,
) -> Result<Credential> {
    let updated = retry_on_locked(|| apply_patch(conn, id, patch))?;
    let raw = updated.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    Credential::try_from(raw)
}

fn apply_patch(
    conn: &mut Connection,
    id: &str,
    patch: &CredentialPatch,
) -> rusqlite::Result<Option<RawCredential>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = tx
        .query_row(
            &format!("SELECT {} FROM credentials WHERE id=?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()?;
    let Some(mut row) = current else {
        return Ok(None);
    };

    if let Some(secret) = &patch.secret {
        row.secret = secret.clone();
    }
    if let Some(description) = &patch.description {
        row.description = description.clone();
    }
    if let Some(active) = patch.active {
        row.active = active;
    }
    if let Some(count) = patch.usage_count {
        row.usage_count = to_sql_count(count);
    }
    if let Some(limit) = patch.usage_limit {
        row.usage_limit = limit.map(to_sql_count);
    }
    if let Some(limit) = row.usage_limit {
        if row.usage_count >= limit {
            row.usage_count = limit;
            row.active = false;
        }
    }
    row.updated_at = now_nanos();

    tx.execute(
        "UPDATE credentials SET secret=?1, description=?2, active=?3, usage_count=?4, usage_limit=?5, updated_at=?6 WHERE id=?7",
        params![
            row.secret,
            row.description,
            row.active,
            row.usage_count,
            row.usage_limit,
            row.updated_at,
            id
        ],
    )?;
    tx.commit()?;
    Ok(Some(row))
}

/**
 * \brief 删除凭据（仅管理操作调用）。
 */
pub fn delete_credential(conn: &Connection, id: &str) -> Result<()> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM credentials WHERE id=?1", params![id]))?;
    if rows == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/**
 * \brief 单条条件 UPDATE 完成自增、停用判断与时间戳刷新。
 * \details WHERE 子句保证并发调用不会把用量推过上限。
 */
pub fn record_usage(conn: &Connection, id: &str) -> Result<Option<Credential>> {
    let now = now_nanos();
    let raw = retry_on_locked(|| {
        conn.query_row(
            &format!(
                "UPDATE credentials
                 SET usage_count = usage_count + 1,
                     active = CASE
                         WHEN usage_limit IS NOT NULL AND usage_count + 1 >= usage_limit THEN 0
                         ELSE active
                     END,
                     last_used_at = ?2,
                     updated_at = ?2
                 WHERE id = ?1
                   AND active = 1
                   AND (usage_limit IS NULL OR usage_count < usage_limit)
                 RETURNING {}",
                COLUMNS
            ),
            params![id, now],
            map_row,
        )
        .optional()
    })?;
    raw.map(Credential::try_from).transpose()
}

/**
 * \brief 在立即事务中检查标记并写入种子凭据。
 * \return 本次是否新写入。
 */
pub fn seed_env_credential(conn: &mut Connection, kind: ProviderKind, secret: &str) -> Result<bool> {
    let seeded = retry_on_locked(|| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM credentials WHERE provider=?1 AND instr(description, ?2) > 0",
            params![kind.as_str(), ENV_SEED_MARKER],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }
        let now = now_nanos();
        tx.execute(
            "INSERT INTO credentials (id, provider, secret, description, active, usage_count, usage_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, 0, NULL, ?5, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                kind.as_str(),
                secret,
                format!("Seeded from {} {}", kind.env_key(), ENV_SEED_MARKER),
                now
            ],
        )?;
        tx.commit()?;
        Ok(true)
    })?;
    Ok(seeded)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, CredentialStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::open(dir.path().join("creds.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn new_cred(provider: ProviderKind, secret: &str, limit: Option<u64>) -> NewCredential {
        NewCredential {
            provider,
            secret: secret.to_string(),
            description: String::new(),
            usage_limit: limit,
        }
    }

    #[tokio::test]
    async fn test_credential_crud() {
        let (_dir, store) = temp_store().await;
        let a = store
            .add(new_cred(ProviderKind::OpenAi, "sk-a", None))
            .await
            .expect("add a");
        let b = store
            .add(new_cred(ProviderKind::Gemini, "g-b", Some(10)))
            .await
            .expect("add b");
        assert!(a.active);
        assert_eq!(a.usage_count, 0);

        let got = store.get(&b.id).await.expect("get").expect("exists");
        assert_eq!(got, b);
        assert_eq!(store.list_all().await.expect("list").len(), 2);
        assert_eq!(
            store
                .list_by_provider(ProviderKind::OpenAi)
                .await
                .expect("by provider")
                .len(),
            1
        );

        let patched = store
            .update(
                &a.id,
                CredentialPatch {
                    description: Some("rotated".into()),
                    secret: Some("sk-a2".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(patched.description, "rotated");
        assert_eq!(patched.secret, "sk-a2");
        assert!(patched.updated_at >= a.updated_at);

        store.delete(&a.id).await.expect("delete");
        assert!(store.get(&a.id).await.expect("get").is_none());
        assert!(matches!(
            store.delete(&a.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update("missing", CredentialPatch::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_active_listing_is_newest_first() {
        let (_dir, store) = temp_store().await;
        let first = store
            .add(new_cred(ProviderKind::Anthropic, "k1", None))
            .await
            .expect("add 1");
        let second = store
            .add(new_cred(ProviderKind::Anthropic, "k2", None))
            .await
            .expect("add 2");
        let third = store
            .add(new_cred(ProviderKind::Anthropic, "k3", None))
            .await
            .expect("add 3");
        store
            .update(
                &second.id,
                CredentialPatch {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("deactivate");

        let active = store
            .list_active_by_provider(ProviderKind::Anthropic)
            .await
            .expect("list active");
        let ids: Vec<_> = active.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn test_record_usage_deactivates_at_limit() {
        let (_dir, store) = temp_store().await;
        let cred = store
            .add(new_cred(ProviderKind::OpenAi, "sk", Some(2)))
            .await
            .expect("add");

        let one = store.record_usage(&cred.id).await.expect("use 1").expect("applied");
        assert_eq!(one.usage_count, 1);
        assert!(one.active);
        assert!(one.last_used_at.is_some());

        let two = store.record_usage(&cred.id).await.expect("use 2").expect("applied");
        assert_eq!(two.usage_count, 2);
        assert!(!two.active);

        assert!(store.record_usage(&cred.id).await.expect("use 3").is_none());
        let stored = store.get(&cred.id).await.expect("get").expect("exists");
        assert_eq!(stored.usage_count, 2);
    }

    #[tokio::test]
    async fn test_zero_limit_inserted_inactive() {
        let (_dir, store) = temp_store().await;
        let cred = store
            .add(new_cred(ProviderKind::Gemini, "g", Some(0)))
            .await
            .expect("add");
        assert!(!cred.active);
        assert!(store.record_usage(&cred.id).await.expect("use").is_none());
    }

    #[tokio::test]
    async fn test_patch_reapplies_limit_invariant() {
        let (_dir, store) = temp_store().await;
        let cred = store
            .add(new_cred(ProviderKind::OpenAi, "sk", None))
            .await
            .expect("add");
        for _ in 0..5 {
            store.record_usage(&cred.id).await.expect("use");
        }
        let lowered = store
            .update(
                &cred.id,
                CredentialPatch {
                    usage_limit: Some(Some(3)),
                    ..Default::default()
                },
            )
            .await
            .expect("lower limit");
        assert_eq!(lowered.usage_count, 3);
        assert!(!lowered.active);

        let reactivated = store
            .update(
                &cred.id,
                CredentialPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .expect("reactivate without reset");
        assert!(!reactivated.active);

        let reset = store
            .update(
                &cred.id,
                CredentialPatch {
                    active: Some(true),
                    usage_count: Some(0),
                    ..Default::default()
                },
            )
            .await
            .expect("reset");
        assert!(reset.active);
        assert_eq!(reset.usage_count, 0);

        let unlimited = store
            .update(
                &cred.id,
                CredentialPatch {
                    usage_limit: Some(None),
                    ..Default::default()
                },
            )
            .await
            .expect("clear limit");
        assert_eq!(unlimited.usage_limit, None);
    }

    #[tokio::test]
    async fn test_concurrent_usage_never_passes_limit() {
        let (_dir, store) = temp_store().await;
        let cred = store
            .add(new_cred(ProviderKind::OpenAi, "sk", Some(5)))
            .await
            .expect("add");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = cred.id.clone();
            handles.push(tokio::spawn(async move { store.record_usage(&id).await }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.expect("join").expect("record").is_some() {
                applied += 1;
            }
        }
        assert_eq!(applied, 5);
        let stored = store.get(&cred.id).await.expect("get").expect("exists");
        assert_eq!(stored.usage_count, 5);
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (_dir, store) = temp_store().await;
        let secrets = ProviderSecrets::default()
            .with(ProviderKind::OpenAi, "sk-env")
            .with(ProviderKind::Gemini, "g-env");

        let first = store.seed_from_config(&secrets).await;
        assert_eq!(first.seeded, vec![ProviderKind::OpenAi, ProviderKind::Gemini]);
        assert!(first.failed.is_empty());

        let second = store.seed_from_config(&secrets).await;
        assert!(second.seeded.is_empty());
        assert_eq!(second.already_present.len(), 2);

        let openai = store
            .list_by_provider(ProviderKind::OpenAi)
            .await
            .expect("list");
        assert_eq!(openai.len(), 1);
        assert!(openai[0].description.contains(ENV_SEED_MARKER));
        assert!(store
            .list_by_provider(ProviderKind::Anthropic)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn test_seed_ignores_admin_credentials() {
        let (_dir, store) = temp_store().await;
        store
            .add(new_cred(ProviderKind::Anthropic, "admin-key", None))
            .await
            .expect("admin add");
        let secrets = ProviderSecrets::default().with(ProviderKind::Anthropic, "env-key");
        let report = store.seed_from_config(&secrets).await;
        assert_eq!(report.seeded, vec![ProviderKind::Anthropic]);
        assert_eq!(
            store
                .list_by_provider(ProviderKind::Anthropic)
                .await
                .expect("list")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_seed_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::open(dir.path().join("creds.db"))
            .await
            .expect("open");
        let conn = open_db(store.path()).expect("conn");
        conn.execute_batch("DROP TABLE credentials;").expect("drop");

        let secrets = ProviderSecrets::default().with(ProviderKind::OpenAi, "sk");
        let report = store.seed_from_config(&secrets).await;
        assert!(report.seeded.is_empty());
        assert_eq!(report.failed.len(), 1);
    }
}

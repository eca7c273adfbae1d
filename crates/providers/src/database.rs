//! Upgrades and versions stored in a shared Postgres database.
//!
//! Rows are keyed by the composite `(height, network, priority)`. The
//! `status` and `step` columns are owned by the state machine of each daemon
//! instance and are never written through the overwrite path.

use helmsman_config::DatabaseProviderConfig;
use helmsman_types::{ProviderKind, Upgrade, UpgradeStatus, UpgradeStep, UpgradeType, Version};
use sqlx::{
    Row as _,
    postgres::{PgPool, PgPoolOptions, PgRow},
};

use crate::{ProviderError, post_process_upgrade, post_process_version};

#[derive(Debug)]
pub struct DatabaseProvider {
    pool: PgPool,
    network: String,
    priority: i32,
}

impl DatabaseProvider {
    /// Build a provider from configuration. The connection is established
    /// lazily on first use.
    pub fn new(cfg: &DatabaseProviderConfig, network: impl Into<String>) -> Result<Self, ProviderError> {
        let dsn = format!(
            "postgres://{user}:{password}@{host}:{port}/{db}?sslmode={sslmode}",
            user = cfg.user,
            password = cfg.password,
            host = cfg.host,
            port = cfg.port,
            db = cfg.db,
            sslmode = cfg.ssl_mode.as_str(),
        );
        let pool = PgPoolOptions::new().connect_lazy(&dsn)?;
        Ok(Self { pool, network: network.into(), priority: cfg.default_priority })
    }

    /// Create the two tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), ProviderError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upgrades (
                height      BIGINT  NOT NULL,
                network     TEXT    NOT NULL,
                priority    INTEGER NOT NULL,
                tag         TEXT    NOT NULL DEFAULT '',
                name        TEXT    NOT NULL DEFAULT '',
                type        TEXT    NOT NULL,
                status      TEXT    NOT NULL,
                step        TEXT    NOT NULL,
                source      TEXT    NOT NULL,
                proposal_id BIGINT,
                PRIMARY KEY (height, network, priority)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS versions (
                height   BIGINT  NOT NULL,
                network  TEXT    NOT NULL,
                priority INTEGER NOT NULL,
                tag      TEXT    NOT NULL,
                source   TEXT    NOT NULL,
                PRIMARY KEY (height, network, priority)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_upgrades(&self) -> Result<Vec<Upgrade>, ProviderError> {
        let rows = sqlx::query(
            "SELECT height, network, priority, tag, name, type, status, step, source, proposal_id \
             FROM upgrades WHERE network = $1",
        )
        .bind(&self.network)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let mut upgrade = upgrade_from_row(&row)?;
                post_process_upgrade(&mut upgrade, ProviderKind::Database, self.priority);
                Ok(upgrade)
            })
            .collect()
    }

    pub async fn add_upgrade(&self, mut upgrade: Upgrade, overwrite: bool) -> Result<(), ProviderError> {
        post_process_upgrade(&mut upgrade, ProviderKind::Database, self.priority);

        if upgrade.network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Database,
                got: upgrade.network,
                expected: self.network.clone(),
            });
        }

        let insert = if overwrite {
            // the conflict target is the compound primary key; status and
            // step stay untouched because the state machine owns them
            "INSERT INTO upgrades (height, network, priority, tag, name, type, status, step, source, proposal_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (height, network, priority) DO UPDATE SET \
             tag = EXCLUDED.tag, name = EXCLUDED.name, type = EXCLUDED.type, \
             source = EXCLUDED.source, proposal_id = EXCLUDED.proposal_id"
        } else {
            "INSERT INTO upgrades (height, network, priority, tag, name, type, status, step, source, proposal_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        };

        let result = sqlx::query(insert)
            .bind(upgrade.height)
            .bind(&upgrade.network)
            .bind(upgrade.priority)
            .bind(&upgrade.tag)
            .bind(&upgrade.name)
            .bind(upgrade.upgrade_type.as_str())
            .bind(upgrade.status.as_str())
            .bind(upgrade.step.as_str())
            .bind(upgrade.source.as_str())
            .bind(upgrade.proposal_id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ProviderError::AlreadyRegistered {
                    height: upgrade.height,
                    priority: upgrade.priority,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn cancel_upgrade(&self, height: i64, network: &str) -> Result<(), ProviderError> {
        if network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Database,
                got: network.to_owned(),
                expected: self.network.clone(),
            });
        }

        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM upgrades WHERE network = $1 AND height = $2")
                .bind(network)
                .bind(height)
                .fetch_one(&self.pool)
                .await?
                .try_get("total")?;

        if total == 0 {
            // nothing registered yet; record the cancellation as a synthetic
            // row so a later registration at the same height stays cancelled
            let upgrade = Upgrade {
                height,
                network: network.to_owned(),
                priority: self.priority,
                upgrade_type: UpgradeType::NonGovernanceUncoordinated,
                status: UpgradeStatus::Cancelled,
                step: UpgradeStep::None,
                source: ProviderKind::Database,
                ..Default::default()
            };
            sqlx::query(
                "INSERT INTO upgrades (height, network, priority, tag, name, type, status, step, source, proposal_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(upgrade.height)
            .bind(&upgrade.network)
            .bind(upgrade.priority)
            .bind(&upgrade.tag)
            .bind(&upgrade.name)
            .bind(upgrade.upgrade_type.as_str())
            .bind(upgrade.status.as_str())
            .bind(upgrade.step.as_str())
            .bind(upgrade.source.as_str())
            .bind(upgrade.proposal_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE upgrades SET status = $1 \
                 WHERE height = $2 AND network = $3 AND priority = ( \
                     SELECT MAX(priority) FROM upgrades WHERE height = $2 AND network = $3 \
                 )",
            )
            .bind(UpgradeStatus::Cancelled.as_str())
            .bind(height)
            .bind(network)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_versions(&self) -> Result<Vec<Version>, ProviderError> {
        let rows = sqlx::query(
            "SELECT height, network, priority, tag, source FROM versions WHERE network = $1",
        )
        .bind(&self.network)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let mut version = version_from_row(&row)?;
                post_process_version(&mut version, ProviderKind::Database, self.priority);
                Ok(version)
            })
            .collect()
    }

    pub async fn register_version(
        &self,
        mut version: Version,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        post_process_version(&mut version, ProviderKind::Database, self.priority);

        if version.network != self.network {
            return Err(ProviderError::NetworkMismatch {
                provider: ProviderKind::Database,
                got: version.network,
                expected: self.network.clone(),
            });
        }

        let insert = if overwrite {
            "INSERT INTO versions (height, network, priority, tag, source) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (height, network, priority) DO UPDATE SET \
             tag = EXCLUDED.tag, source = EXCLUDED.source"
        } else {
            "INSERT INTO versions (height, network, priority, tag, source) \
             VALUES ($1, $2, $3, $4, $5)"
        };

        let result = sqlx::query(insert)
            .bind(version.height)
            .bind(&version.network)
            .bind(version.priority)
            .bind(&version.tag)
            .bind(version.source.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ProviderError::AlreadyRegistered {
                    height: version.height,
                    priority: version.priority,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_enum<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, ProviderError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|err| ProviderError::Invalid(format!("invalid {column} column: {err}")))
}

fn upgrade_from_row(row: &PgRow) -> Result<Upgrade, ProviderError> {
    Ok(Upgrade {
        height: row.try_get("height")?,
        network: row.try_get("network")?,
        priority: row.try_get("priority")?,
        tag: row.try_get("tag")?,
        name: row.try_get("name")?,
        upgrade_type: parse_enum(row, "type")?,
        status: parse_enum(row, "status")?,
        step: parse_enum(row, "step")?,
        source: parse_enum(row, "source")?,
        proposal_id: row.try_get("proposal_id")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<Version, ProviderError> {
    Ok(Version {
        height: row.try_get("height")?,
        network: row.try_get("network")?,
        priority: row.try_get("priority")?,
        tag: row.try_get("tag")?,
        source: parse_enum(row, "source")?,
    })
}

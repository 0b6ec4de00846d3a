//! Database-side provisioning of the notify trigger.
//!
//! Installs a plpgsql function that publishes
//! `{"table", "action", "data"}` to the notify channel, and attaches it to
//! tables as an `AFTER INSERT OR UPDATE OR DELETE` row trigger.

use sqlx::PgPool;
use tracing::info;

use crate::error::{Error, Result};

/// Check that `name` is a plain or schema-qualified SQL identifier.
///
/// Names are interpolated into DDL unquoted, where Postgres folds them to
/// lower case, so only `[a-z_][a-z0-9_]*` segments are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() > 2 {
        return Err(Error::InvalidIdentifier(name.to_string()));
    }

    for segment in segments {
        let mut chars = segment.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(Error::InvalidIdentifier(name.to_string()));
        }
    }

    Ok(())
}

/// Name of the trigger installed on `table`, as stored in `pg_trigger`.
pub fn trigger_name(table: &str) -> String {
    let relation = table.rsplit('.').next().unwrap_or(table);
    format!("{}_notify_event", relation.to_ascii_lowercase())
}

/// `CREATE OR REPLACE FUNCTION` statement for the notify function.
pub fn function_sql(function: &str, channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$
DECLARE
    data json;
    push json;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        data = row_to_json(OLD);
    ELSE
        data = row_to_json(NEW);
    END IF;

    push = json_build_object(
        'table', TG_TABLE_NAME,
        'action', TG_OP,
        'data', data
    );

    PERFORM pg_notify('{channel}', push::text);

    RETURN NULL;
END;
$$ LANGUAGE plpgsql;"#
    )
}

/// `CREATE TRIGGER` statement attaching `function` to `table`.
pub fn trigger_sql(table: &str, function: &str) -> String {
    format!(
        "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE PROCEDURE {function}();",
        trigger = trigger_name(table),
    )
}

const TRIGGER_EXISTS_SQL: &str = "SELECT EXISTS (\
    SELECT 1 FROM pg_trigger \
    WHERE NOT tgisinternal AND tgrelid = $1::regclass AND tgname = $2)";

/// Installs the notify function and per-table triggers.
pub struct TriggerProvisioner {
    pool: PgPool,
    function: String,
    channel: String,
}

impl TriggerProvisioner {
    pub fn new(pool: PgPool, function: impl Into<String>, channel: impl Into<String>) -> Result<Self> {
        let function = function.into();
        let channel = channel.into();
        validate_identifier(&function)?;
        validate_identifier(&channel)?;

        Ok(Self {
            pool,
            function,
            channel,
        })
    }

    /// Create or replace the notify function.
    pub async fn create_function(&self) -> Result<()> {
        sqlx::raw_sql(&function_sql(&self.function, &self.channel))
            .execute(&self.pool)
            .await?;

        info!(function = %self.function, channel = %self.channel, "notify function installed");
        Ok(())
    }

    /// Attach the notify trigger to `table` unless it is already there.
    ///
    /// Returns `true` if a trigger was created.
    pub async fn register_table(&self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        let trigger = trigger_name(table);

        let exists: bool = sqlx::query_scalar(TRIGGER_EXISTS_SQL)
            .bind(table)
            .bind(&trigger)
            .fetch_one(&self.pool)
            .await?;

        if exists {
            info!(table, trigger = %trigger, "notify trigger already present");
            return Ok(false);
        }

        sqlx::raw_sql(&trigger_sql(table, &self.function))
            .execute(&self.pool)
            .await?;

        info!(table, trigger = %trigger, "notify trigger created");
        Ok(true)
    }

    /// Install the function, then a trigger on each table.
    pub async fn provision<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> Result<()> {
        self.create_function().await?;
        for table in tables {
            self.register_table(table).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        for name in ["users", "_audit", "public.users", "order_items2"] {
            assert!(validate_identifier(name).is_ok(), "{name}");
        }

        for name in ["", "1users", "users;drop", "a.b.c", "public.", "us-ers", "users'"] {
            let err = validate_identifier(name).unwrap_err();
            assert!(matches!(err, Error::InvalidIdentifier(_)), "{name}");
        }
    }

    #[test]
    fn test_trigger_name() {
        assert_eq!(trigger_name("users"), "users_notify_event");
        assert_eq!(trigger_name("public.users"), "users_notify_event");
        assert_eq!(trigger_name("Order_Items2"), "order_items2_notify_event");
    }

    #[test]
    fn test_mixed_case_identifiers_rejected() {
        for name in ["Order_Items2", "Public.users", "public.Users", "LISTENER"] {
            let err = validate_identifier(name).unwrap_err();
            assert!(matches!(err, Error::InvalidIdentifier(_)), "{name}");
        }
    }

    #[test]
    fn test_function_sql() {
        let sql = function_sql("listener", "events");

        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION listener() RETURNS TRIGGER"));
        assert!(sql.contains("row_to_json(OLD)"));
        assert!(sql.contains("row_to_json(NEW)"));
        assert!(sql.contains("'table', TG_TABLE_NAME"));
        assert!(sql.contains("'action', TG_OP"));
        assert!(sql.contains("PERFORM pg_notify('events', push::text);"));
        assert!(sql.ends_with("LANGUAGE plpgsql;"));
    }

    #[test]
    fn test_trigger_sql() {
        assert_eq!(
            trigger_sql("public.users", "listener"),
            "CREATE TRIGGER users_notify_event AFTER INSERT OR UPDATE OR DELETE ON public.users \
             FOR EACH ROW EXECUTE PROCEDURE listener();"
        );
    }
}

// ============================================================================
// PostgreSQL driver (tokio-postgres)
// ============================================================================

use super::{Driver, DriverConnection};
use crate::connection::config::Endpoint;
use crate::core::{DbError, Result, Value};
use crate::result::{QueryResult, Row};
use crate::session::Operation;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};

/// Driver for PostgreSQL endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DriverConnection>> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .dbname(&endpoint.database)
            .user(&endpoint.username)
            .connect_timeout(endpoint.connect_timeout);
        if !endpoint.password.is_empty() {
            config.password(&endpoint.password);
        }
        if let Some(options) = &endpoint.options {
            config.options(options);
        }

        let (client, connection) = config.connect(NoTls).await?;
        let address = endpoint.address();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("Postgres connection to {} ended with error: {}", address, err);
            }
        });
        debug!("Opened postgres connection to {}", endpoint.address());

        Ok(Box::new(PostgresConnection {
            client,
            in_transaction: false,
        }))
    }
}

struct PostgresConnection {
    client: Client,
    in_transaction: bool,
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute(&mut self, operation: &Operation) -> Result<QueryResult> {
        let params: Vec<&(dyn ToSql + Sync)> = operation
            .params()
            .iter()
            .map(|value| value as &(dyn ToSql + Sync))
            .collect();

        let statement = self.client.prepare(operation.sql()).await?;
        if statement.columns().is_empty() {
            let affected = self.client.execute(&statement, &params).await?;
            return Ok(QueryResult::affected(affected));
        }

        let columns = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        let rows = self
            .client
            .query(&statement, &params)
            .await?
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<Row>>>()?;

        Ok(QueryResult::new(columns, rows))
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(DbError::ExecutionError("Transaction already active".into()));
        }
        self.client.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        // The server ends the transaction whether or not COMMIT succeeds.
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        if self.client.is_closed() {
            return Err(DbError::DriverError("connection is closed".into()));
        }
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client terminates the background connection task.
        self.in_transaction = false;
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
    {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    } else {
        return Err(DbError::UnsupportedType(format!(
            "column '{}' has type {}",
            row.columns()[idx].name(),
            ty
        )));
    };

    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Boolean(b) => b.to_sql(ty, out),
            Value::Integer(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Text(s) => s.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        let is_constraint = err
            .code()
            .map(|code| code.code().starts_with("23"))
            .unwrap_or(false);

        if is_constraint {
            let detail = err
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string());
            return DbError::ConstraintViolation(detail);
        }

        if err.code() == Some(&SqlState::QUERY_CANCELED) {
            return DbError::ExecutionError(err.to_string());
        }

        DbError::DriverError(err.to_string())
    }
}

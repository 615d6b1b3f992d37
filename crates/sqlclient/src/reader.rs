//! Streaming result reader.

use std::sync::Arc;

use bytes::Bytes;
use tds_protocol::{ColumnData, RowData, Token};
use tracing::Instrument;

use crate::client::Connection;
use crate::command::{Completion, Execution};
use crate::error::{Error, Result};

/// Forward-only reader over the result sets of one execution.
///
/// The reader holds the connection's session until it is closed or
/// dropped. Dropping it early leaves the rest of the response on the wire;
/// the connection drains it before the next execution.
///
/// ```rust,ignore
/// let mut reader = conn.command("SELECT id, name FROM users").execute_reader_async().await?;
/// while reader.read().await? {
///     let id = reader.get_bytes(0);
/// }
/// reader.close().await?;
/// ```
pub struct DataReader<'c> {
    connection: &'c mut Connection,
    exec: Option<Execution>,
    completion: Option<Completion>,
    columns: Arc<[ColumnData]>,
    row: Option<RowData>,
    in_result: bool,
    records_affected: Option<u64>,
}

impl<'c> DataReader<'c> {
    /// Position a new reader on the first result set.
    pub(crate) async fn open(
        connection: &'c mut Connection,
        exec: Execution,
        completion: Completion,
    ) -> Result<Self> {
        let mut reader = Self {
            connection,
            exec: Some(exec),
            completion: Some(completion),
            columns: Arc::from(Vec::new()),
            row: None,
            in_result: false,
            records_affected: None,
        };
        reader.advance_to_result().await?;
        Ok(reader)
    }

    /// Advance to the next row of the current result set.
    pub async fn read(&mut self) -> Result<bool> {
        self.row = None;
        if !self.in_result {
            return Ok(false);
        }
        let span = self.span();
        loop {
            let token = self.next_token().instrument(span.clone()).await?;
            match token {
                Some(Token::Row(row)) => {
                    self.row = Some(row);
                    return Ok(true);
                }
                Some(Token::Done(_)) => {
                    self.in_result = false;
                    return Ok(false);
                }
                Some(_) => {}
                None => {
                    self.in_result = false;
                    self.finish().await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Skip the rest of the current result set and move to the next one.
    pub async fn next_result(&mut self) -> Result<bool> {
        while self.read().await? {}
        self.advance_to_result().await
    }

    /// Columns of the current result set.
    #[must_use]
    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }

    /// Number of columns in the current result set.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Raw bytes of column `ordinal` in the current row; `None` for null or
    /// when no row is current.
    #[must_use]
    pub fn get_bytes(&self, ordinal: usize) -> Option<&Bytes> {
        self.row.as_ref()?.values.get(ordinal)?.as_ref()
    }

    /// Whether column `ordinal` of the current row is null.
    #[must_use]
    pub fn is_null(&self, ordinal: usize) -> bool {
        self.get_bytes(ordinal).is_none()
    }

    /// Rows changed by statements that returned no result set, once known.
    #[must_use]
    pub fn records_affected(&self) -> Option<u64> {
        match &self.exec {
            Some(exec) => exec.rows_affected(),
            None => self.records_affected,
        }
    }

    /// Consume the remaining results and release the session.
    ///
    /// Surfaces the first server error of the response, if any.
    pub async fn close(mut self) -> Result<()> {
        let span = self.span();
        async {
            while self.next_token().await?.is_some() {}
            self.finish().await
        }
        .instrument(span)
        .await
    }

    fn span(&self) -> tracing::Span {
        self.completion
            .as_ref()
            .map_or_else(tracing::Span::none, Completion::span)
    }

    async fn next_token(&mut self) -> Result<Option<Token>> {
        let Some(exec) = self.exec.as_mut() else {
            return Ok(None);
        };
        match exec.next_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn advance_to_result(&mut self) -> Result<bool> {
        self.row = None;
        let span = self.span();
        loop {
            match self.next_token().instrument(span.clone()).await? {
                Some(Token::ColMetaData(meta)) if !meta.columns.is_empty() => {
                    self.columns = Arc::from(meta.columns);
                    self.in_result = true;
                    return Ok(true);
                }
                Some(_) => {}
                None => {
                    self.in_result = false;
                    self.finish().await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Release after the response completed, reporting its outcome.
    async fn finish(&mut self) -> Result<()> {
        let Some(mut exec) = self.exec.take() else {
            return Ok(());
        };
        let outcome = exec.outcome();
        self.records_affected = exec.rows_affected();
        let conn = exec.into_connection().await;
        self.connection.end_execution(conn);
        if let Some(completion) = self.completion.take() {
            completion.finish(self.connection, self.records_affected, outcome.as_ref().err());
        }
        outcome
    }

    /// Release after a read failed.
    async fn fail(&mut self, error: &Error) {
        self.in_result = false;
        if let Some(exec) = self.exec.take() {
            self.records_affected = exec.rows_affected();
            let conn = exec.into_connection().await;
            self.connection.end_execution(conn);
        }
        if let Some(completion) = self.completion.take() {
            completion.finish(self.connection, None, Some(error));
        }
    }
}

impl Drop for DataReader<'_> {
    fn drop(&mut self) {
        if let Some(exec) = self.exec.take() {
            self.records_affected = exec.rows_affected();
            let conn = exec.into_connection_now();
            self.connection.end_execution(conn);
        }
        if let Some(completion) = self.completion.take() {
            completion.finish(self.connection, self.records_affected, None);
        }
    }
}

impl std::fmt::Debug for DataReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("columns", &self.columns.len())
            .field("in_result", &self.in_result)
            .field("open", &self.exec.is_some())
            .finish_non_exhaustive()
    }
}

//! The database session.
//!
//! [`Database`] owns one logical connection. Connection and transaction use
//! are reference counted, so operations nest freely: the physical connection
//! opens on the first acquire and closes when the last holder releases it,
//! and nested transactions commit only when the outermost scope completes
//! with no inner scope having aborted.
//!
//! A session is used by one flow of control at a time; every operation takes
//! `&mut self`. Share the [`MappingContext`] between sessions instead.

use crate::config::SessionOptions;
use crate::db::driver::{Connection, Driver};
use crate::db::hooks::{DatabaseHooks, TracingHooks};
use crate::error::{DbError, DbResult};
use crate::mapping::{Entity, JoinPlan, MappingContext, Materializable, ShapeTuple};
use crate::models::{
    Arg, Command, Dialect, FieldValue, Page, Value, coerce,
};
use crate::sql::{
    PageQueries, ParameterBinder, add_select_clause, build_page_queries, create_parameter,
    locate_placeholders, page_offset,
};
use async_stream::{stream, try_stream};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::any::TypeId;
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Read the row stream built by `$read` on a scoped connection.
///
/// The connection is closed once the rows end, `$limit` rows have been
/// produced, or reading fails. A failure is yielded after the close.
macro_rules! scoped_rows {
    ($db:expr, $limit:expr, |$conn:ident| $read:expr) => {
        Box::pin(stream! {
            let mut scope = match ConnectionScope::open($db).await {
                Ok(scope) => scope,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let limit: Option<usize> = $limit;
            let mut failure = None;
            {
                let $conn: &mut Database = &mut scope;
                let mut rows = $read;
                let mut produced = 0usize;
                while limit.is_none_or(|limit| produced < limit) {
                    match rows.next().await {
                        Some(Ok(item)) => {
                            produced += 1;
                            yield Ok(item);
                        }
                        Some(Err(e)) => {
                            failure = Some(e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            let released = scope.release().await;
            match (failure, released) {
                (Some(e), released) => {
                    if let Err(close) = released {
                        warn!(error = %close, "Failed to close connection after a query error");
                    }
                    yield Err(e);
                }
                (None, Err(e)) => yield Err(e),
                (None, Ok(())) => {}
            }
        })
    };
}

/// A stream that fails before touching the connection.
fn failed_stream<'a, T: Send + 'a>(error: DbError) -> BoxStream<'a, DbResult<T>> {
    futures_util::stream::once(async move { Err(error) }).boxed()
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Database`].
pub struct DatabaseBuilder {
    driver: Arc<dyn Driver>,
    context: Option<Arc<MappingContext>>,
    hooks: Option<Arc<dyn DatabaseHooks>>,
    options: SessionOptions,
    provider_name: Option<String>,
}

impl DatabaseBuilder {
    /// Share a mapping context, and with it every mapping cache.
    pub fn context(mut self, context: Arc<MappingContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn DatabaseHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Provider name for dialect detection. Takes precedence over both the
    /// `provider` option and the driver's own name.
    pub fn provider_name(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = Some(provider_name.into());
        self
    }

    pub fn build(self) -> DbResult<Database> {
        self.options.validate().map_err(DbError::invalid_input)?;

        let provider_name = self
            .provider_name
            .or_else(|| self.options.provider.clone())
            .unwrap_or_else(|| self.driver.provider_name().to_string());
        let dialect = Dialect::from_provider_name(&provider_name);
        let connection_string = self.driver.connection_string().to_string();
        let param_prefix = dialect.param_prefix(&connection_string);

        info!(
            provider = %provider_name,
            dialect = %dialect,
            param_prefix = param_prefix,
            "Database session created"
        );

        Ok(Database {
            driver: self.driver,
            context: self
                .context
                .unwrap_or_else(|| Arc::new(MappingContext::new())),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(TracingHooks)),
            dialect,
            provider_name,
            connection_string,
            param_prefix,
            auto_select: self.options.auto_select_or_default(),
            named_params: self.options.named_params_or_default(),
            force_utc: self.options.force_utc_or_default(),
            keep_alive: self.options.keep_alive_or_default(),
            command_timeout: self.options.command_timeout(),
            one_time_command_timeout: None,
            connection: None,
            connection_depth: 0,
            transaction_depth: 0,
            transaction_cancelled: false,
            last_sql: None,
            last_args: Vec::new(),
        })
    }
}

// =============================================================================
// Database
// =============================================================================

/// A database session.
pub struct Database {
    driver: Arc<dyn Driver>,
    context: Arc<MappingContext>,
    hooks: Arc<dyn DatabaseHooks>,
    dialect: Dialect,
    provider_name: String,
    connection_string: String,
    param_prefix: &'static str,
    auto_select: bool,
    named_params: bool,
    force_utc: bool,
    keep_alive: bool,
    command_timeout: Option<Duration>,
    one_time_command_timeout: Option<Duration>,
    connection: Option<Box<dyn Connection>>,
    connection_depth: usize,
    transaction_depth: usize,
    transaction_cancelled: bool,
    last_sql: Option<String>,
    last_args: Vec<Value>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("provider_name", &self.provider_name)
            .field("dialect", &self.dialect)
            .field("connection_depth", &self.connection_depth)
            .field("transaction_depth", &self.transaction_depth)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn builder(driver: Arc<dyn Driver>) -> DatabaseBuilder {
        DatabaseBuilder {
            driver,
            context: None,
            hooks: None,
            options: SessionOptions::default(),
            provider_name: None,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    pub fn param_prefix(&self) -> &str {
        self.param_prefix
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    pub fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.command_timeout = timeout;
    }

    /// Timeout for the next command only, overriding the session timeout.
    pub fn set_one_time_command_timeout(&mut self, timeout: Duration) {
        self.one_time_command_timeout = Some(timeout);
    }

    pub fn connection_depth(&self) -> usize {
        self.connection_depth
    }

    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Acquire the shared connection, opening it if this is the first holder.
    pub async fn open_shared_connection(&mut self) -> DbResult<()> {
        if self.connection_depth == 0 {
            let connection = match self.driver.open().await {
                Ok(connection) => connection,
                Err(e) => return self.observe(Err(e)),
            };
            self.connection = Some(self.hooks.on_connection_opened(connection));
            if self.keep_alive {
                self.connection_depth += 1;
            }
        }
        self.connection_depth += 1;
        Ok(())
    }

    /// Release the shared connection, closing it when the last holder lets go.
    /// Releasing with nothing held is a no-op.
    pub async fn close_shared_connection(&mut self) -> DbResult<()> {
        match self.release_connection() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    /// Drop one connection reference. Returns the connection when it is no
    /// longer held so the caller can close it.
    fn release_connection(&mut self) -> Option<Box<dyn Connection>> {
        if self.connection_depth == 0 {
            return None;
        }
        self.connection_depth -= 1;
        if self.connection_depth > 0 {
            return None;
        }
        let mut connection = self.connection.take()?;
        self.hooks.on_connection_closing(connection.as_mut());
        Some(connection)
    }

    fn connection_mut(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::internal("no open connection"))
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction scope. Scopes nest; only the outermost one starts
    /// a physical transaction.
    pub async fn begin_transaction(&mut self) -> DbResult<()> {
        self.transaction_depth += 1;
        if self.transaction_depth == 1 {
            if let Err(e) = self.start_transaction().await {
                self.transaction_depth = 0;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn start_transaction(&mut self) -> DbResult<()> {
        self.open_shared_connection().await?;
        let started = self.connection_mut()?.begin_transaction().await;
        if let Err(e) = started {
            let _ = self.close_shared_connection().await;
            return self.observe(Err(e));
        }
        self.transaction_cancelled = false;
        self.hooks.on_begin_transaction();
        debug!("Transaction started");
        Ok(())
    }

    /// Complete the innermost transaction scope.
    pub async fn complete_transaction(&mut self) -> DbResult<()> {
        self.leave_transaction("complete_transaction").await
    }

    /// Abort the innermost transaction scope. The whole transaction rolls
    /// back when the outermost scope ends.
    pub async fn abort_transaction(&mut self) -> DbResult<()> {
        if self.transaction_depth > 0 {
            self.transaction_cancelled = true;
        }
        self.leave_transaction("abort_transaction").await
    }

    async fn leave_transaction(&mut self, operation: &str) -> DbResult<()> {
        self.transaction_depth = self.transaction_depth.checked_sub(1).ok_or_else(|| {
            DbError::transaction(format!(
                "{} called without a matching begin_transaction",
                operation
            ))
        })?;
        if self.transaction_depth > 0 {
            return Ok(());
        }

        let committing = !self.transaction_cancelled;
        self.hooks.on_end_transaction(committing);
        let finished = match self.connection_mut() {
            Ok(connection) if committing => connection.commit().await,
            Ok(connection) => connection.rollback().await,
            Err(e) => Err(e),
        };
        if committing {
            debug!("Transaction committed");
        } else {
            warn!("Transaction rolled back");
        }
        let closed = self.close_shared_connection().await;
        self.observe(finished.and(closed))
    }

    /// Run `f` inside a transaction scope that completes when `f` succeeds
    /// and aborts when it fails.
    ///
    /// ```no_run
    /// # async fn example(db: &mut rowshape::db::Database) -> rowshape::error::DbResult<()> {
    /// db.with_transaction(|db| {
    ///     Box::pin(async move {
    ///         db.execute("UPDATE accounts SET balance = balance - @0 WHERE id = @1", &rowshape::args![10, 1]).await?;
    ///         db.execute("UPDATE accounts SET balance = balance + @0 WHERE id = @1", &rowshape::args![10, 2]).await?;
    ///         Ok(())
    ///     })
    /// })
    /// .await
    /// # }
    /// ```
    pub async fn with_transaction<R, F>(&mut self, f: F) -> DbResult<R>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut Database) -> BoxFuture<'c, DbResult<R>> + Send,
    {
        self.begin_transaction().await?;
        match f(self).await {
            Ok(value) => {
                self.complete_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = self.abort_transaction().await {
                    warn!(error = %abort, "Failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Bind `sql` and `args` into a command ready for the driver.
    fn create_command(&mut self, sql: &str, args: &[Arg]) -> DbResult<Command> {
        let bound = ParameterBinder::new(self.param_prefix, self.named_params).bind(sql, args)?;
        let mapper = self.context.mapper();
        let parameters = bound
            .args
            .into_iter()
            .enumerate()
            .map(|(i, arg)| create_parameter(arg, self.param_prefix, i, self.dialect, mapper))
            .collect::<DbResult<Vec<_>>>()?;

        let mut command = Command {
            sql: bound.sql,
            parameters,
            placeholders: bound.placeholders,
            timeout: self
                .one_time_command_timeout
                .take()
                .or(self.command_timeout),
        };
        let bound_sql = command.sql.clone();
        self.hooks.on_executing_command(&mut command);
        if command.sql != bound_sql && !command.placeholders.is_empty() {
            command.placeholders =
                locate_placeholders(&command.sql, self.param_prefix, command.parameters.len());
        }

        debug!(
            sql = %command.sql,
            args = command.parameters.len(),
            "Executing command"
        );
        self.last_sql = Some(command.sql.clone());
        self.last_args = command.parameters.iter().map(|p| p.value.clone()).collect();
        Ok(command)
    }

    /// Report a failure to the hooks, then hand the result back.
    fn observe<T>(&self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            self.hooks.on_exception(e, &self.last_command());
        }
        result
    }

    /// Execute a statement that returns no rows. Returns the affected row count.
    pub async fn execute(&mut self, sql: &str, args: &[Arg]) -> DbResult<u64> {
        self.open_shared_connection().await?;
        let result = self.execute_command(sql, args).await;
        let result = self.observe(result);
        let closed = self.close_shared_connection().await;
        let affected = result?;
        closed?;
        Ok(affected)
    }

    async fn execute_command(&mut self, sql: &str, args: &[Arg]) -> DbResult<u64> {
        let command = self.create_command(sql, args)?;
        let affected = self.connection_mut()?.execute(&command).await?;
        self.hooks.on_executed_command(&command);
        Ok(affected)
    }

    /// Execute a query and return the first column of the first row.
    pub async fn execute_scalar<T: FieldValue>(&mut self, sql: &str, args: &[Arg]) -> DbResult<T> {
        self.open_shared_connection().await?;
        let result = self.scalar_command(sql, args).await;
        let result = self.observe(result.and_then(|v| T::from_value(coerce(v, T::FIELD_TYPE.kind)?)));
        let closed = self.close_shared_connection().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    async fn scalar_command(&mut self, sql: &str, args: &[Arg]) -> DbResult<Value> {
        let command = self.create_command(sql, args)?;
        let value = self.connection_mut()?.scalar(&command).await?;
        self.hooks.on_executed_command(&command);
        Ok(value)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Prefix `sql` with a SELECT clause for `T` when auto-select is on.
    fn auto_select_sql<T: Materializable>(&self, sql: &str) -> DbResult<String> {
        if !self.auto_select {
            return Ok(sql.to_string());
        }
        let source = T::select_source(self.context.shapes())?;
        Ok(add_select_clause(sql, source.as_ref(), self.dialect))
    }

    /// Stream the rows of a query, materialized as `T`.
    ///
    /// The stream is lazy and single pass. The connection is held while it
    /// is being read. It is closed once the rows end or reading fails, and
    /// released without a graceful close when the stream is dropped early.
    pub fn query<'a, T: Materializable>(
        &'a mut self,
        sql: &'a str,
        args: &'a [Arg],
    ) -> BoxStream<'a, DbResult<T>> {
        self.query_at_most::<T>(sql, args, None)
    }

    /// Like [`query`](Self::query), but stops reading after `limit` rows
    /// and closes the connection then.
    fn query_at_most<'a, T: Materializable>(
        &'a mut self,
        sql: &'a str,
        args: &'a [Arg],
        limit: Option<usize>,
    ) -> BoxStream<'a, DbResult<T>> {
        match self.observe(self.auto_select_sql::<T>(sql)) {
            Ok(sql) => scoped_rows!(self, limit, |db| db.read_rows::<T>(&sql, args)),
            Err(e) => failed_stream(e),
        }
    }

    /// Rows of `sql` materialized as `T`. The connection must be open.
    fn read_rows<'s, T: Materializable>(
        &'s mut self,
        sql: &'s str,
        args: &'s [Arg],
    ) -> BoxStream<'s, DbResult<T>> {
        Box::pin(try_stream! {
            let command = self.create_command(sql, args);
            let command = self.observe(command)?;
            let reader = self.reader();

            let mut cursor = reader.observe(self.connection_mut()?.query(&command).await)?;
            reader.hooks.on_executed_command(&command);
            let mut materializer = None;
            while let Some(mut row) = reader.observe(cursor.next_row().await)? {
                let materialize = match &materializer {
                    Some(m) => Arc::clone(m),
                    None => {
                        let compiled = reader.observe(reader.context.materializer_for::<T>(
                            sql,
                            &reader.connection_string,
                            cursor.schema(),
                            reader.force_utc,
                        ))?;
                        materializer = Some(Arc::clone(&compiled));
                        compiled
                    }
                };
                yield reader.observe(materialize.materialize(&mut row))?;
            }
        })
    }

    /// Run a query and collect every row.
    pub async fn fetch<T: Materializable>(&mut self, sql: &str, args: &[Arg]) -> DbResult<Vec<T>> {
        self.query::<T>(sql, args).try_collect().await
    }

    /// Stream a multi-shape query, combining each row's parts with `combine`.
    ///
    /// Each row's columns are split between the shapes of `S`; a shape whose
    /// columns are all null arrives as `None`. When `combine` returns `None`
    /// for any row, it is called once more after the last row with every part
    /// `None`, so an accumulating combinator can flush its final item.
    pub fn query_multi<'a, S, R, F>(
        &'a mut self,
        sql: &'a str,
        args: &'a [Arg],
        combine: F,
    ) -> BoxStream<'a, DbResult<R>>
    where
        S: ShapeTuple,
        R: Send + 'static,
        F: FnMut(S::Parts) -> Option<R> + Send + 'a,
    {
        scoped_rows!(self, None, |db| db.read_multi::<S, R, F>(sql, args, combine))
    }

    fn read_multi<'s, S, R, F>(
        &'s mut self,
        sql: &'s str,
        args: &'s [Arg],
        mut combine: F,
    ) -> BoxStream<'s, DbResult<R>>
    where
        S: ShapeTuple,
        R: Send + 'static,
        F: FnMut(S::Parts) -> Option<R> + Send + 's,
    {
        Box::pin(try_stream! {
            let command = self.create_command(sql, args);
            let command = self.observe(command)?;
            let reader = self.reader();

            let mut cursor = reader.observe(self.connection_mut()?.query(&command).await)?;
            reader.hooks.on_executed_command(&command);
            let mut plan = None;
            let mut needs_terminator = false;
            while let Some(mut row) = reader.observe(cursor.next_row().await)? {
                let split = match &plan {
                    Some(p) => Arc::clone(p),
                    None => {
                        let compiled = reader.observe(reader.context.multi_shape_plan::<S>(
                            TypeId::of::<R>(),
                            sql,
                            &reader.connection_string,
                            cursor.schema(),
                            reader.force_utc,
                        ))?;
                        plan = Some(Arc::clone(&compiled));
                        compiled
                    }
                };
                let parts = reader.observe(split.materialize(&mut row).and_then(S::into_parts))?;
                match combine(parts) {
                    Some(item) => yield item,
                    None => needs_terminator = true,
                }
            }
            drop(cursor);
            if needs_terminator {
                if let Some(item) = combine(S::empty_parts()) {
                    yield item;
                }
            }
        })
    }

    /// Run a multi-shape query with a combinator and collect the results.
    pub async fn fetch_multi<S, R, F>(&mut self, sql: &str, args: &[Arg], combine: F) -> DbResult<Vec<R>>
    where
        S: ShapeTuple,
        R: Send + 'static,
        F: FnMut(S::Parts) -> Option<R> + Send,
    {
        self.query_multi::<S, R, F>(sql, args, combine)
            .try_collect()
            .await
    }

    /// Stream a multi-shape query, nesting later shapes into the earlier
    /// shapes that declare a relation to them. Yields the first shape.
    pub fn query_joined<'a, S: ShapeTuple>(
        &'a mut self,
        sql: &'a str,
        args: &'a [Arg],
    ) -> BoxStream<'a, DbResult<S::First>> {
        match self.observe(self.context.join_plan::<S>()) {
            Ok(join) => scoped_rows!(self, None, |db| db.read_joined::<S>(join, sql, args)),
            Err(e) => failed_stream(e),
        }
    }

    fn read_joined<'s, S: ShapeTuple>(
        &'s mut self,
        join: Arc<JoinPlan>,
        sql: &'s str,
        args: &'s [Arg],
    ) -> BoxStream<'s, DbResult<S::First>> {
        Box::pin(try_stream! {
            let command = self.create_command(sql, args);
            let command = self.observe(command)?;
            let reader = self.reader();

            let mut cursor = reader.observe(self.connection_mut()?.query(&command).await)?;
            reader.hooks.on_executed_command(&command);
            let mut plan = None;
            while let Some(mut row) = reader.observe(cursor.next_row().await)? {
                let split = match &plan {
                    Some(p) => Arc::clone(p),
                    None => {
                        let compiled = reader.observe(reader.context.multi_shape_plan::<S>(
                            TypeId::of::<S::First>(),
                            sql,
                            &reader.connection_string,
                            cursor.schema(),
                            reader.force_utc,
                        ))?;
                        plan = Some(Arc::clone(&compiled));
                        compiled
                    }
                };
                let parts = reader.observe(split.materialize(&mut row))?;
                if let Some(item) = reader.observe(join.join::<S>(parts))? {
                    yield item;
                }
            }
        })
    }

    /// Run an auto-joined multi-shape query and collect the results.
    pub async fn fetch_joined<S: ShapeTuple>(
        &mut self,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Vec<S::First>> {
        self.query_joined::<S>(sql, args).try_collect().await
    }

    // =========================================================================
    // Paging
    // =========================================================================

    /// Build the count and page queries for `sql` as `T` would be queried.
    pub fn build_page_queries<T: Materializable>(
        &self,
        skip: u64,
        take: u64,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<PageQueries> {
        let sql = self.auto_select_sql::<T>(sql)?;
        build_page_queries(self.dialect, skip, take, &sql, args.to_vec())
    }

    /// Fetch one page of results plus the total item count.
    ///
    /// `page` is 1-based. The one-time command timeout applies to both the
    /// count and the page query.
    pub async fn page<T: Materializable>(
        &mut self,
        page: u64,
        items_per_page: u64,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Page<T>> {
        let queries = self.observe(self.build_page_queries::<T>(
            page_offset(page, items_per_page),
            items_per_page,
            sql,
            args,
        ))?;

        let saved_timeout = self.one_time_command_timeout;
        let total = self
            .execute_scalar::<i64>(&queries.count_sql, &queries.args)
            .await?;
        self.one_time_command_timeout = saved_timeout;
        let total = u64::try_from(total)
            .map_err(|_| DbError::conversion("i64", "u64", "negative row count"))?;

        let items = self.fetch::<T>(&queries.page_sql, &queries.args).await?;
        Ok(Page::new(page, items_per_page, total, items))
    }

    /// Fetch one 1-based page of results without counting.
    pub async fn fetch_page<T: Materializable>(
        &mut self,
        page: u64,
        items_per_page: u64,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Vec<T>> {
        self.skip_take(page_offset(page, items_per_page), items_per_page, sql, args)
            .await
    }

    /// Skip `skip` rows and fetch at most `take`.
    pub async fn skip_take<T: Materializable>(
        &mut self,
        skip: u64,
        take: u64,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Vec<T>> {
        let queries = self.observe(self.build_page_queries::<T>(skip, take, sql, args))?;
        self.fetch::<T>(&queries.page_sql, &queries.args).await
    }

    // =========================================================================
    // Single rows
    // =========================================================================

    async fn fetch_at_most<T: Materializable>(
        &mut self,
        sql: &str,
        args: &[Arg],
        limit: usize,
    ) -> DbResult<Vec<T>> {
        self.query_at_most::<T>(sql, args, Some(limit))
            .try_collect()
            .await
    }

    /// Exactly one row; fails when the query returns none or several.
    pub async fn single<T: Materializable>(&mut self, sql: &str, args: &[Arg]) -> DbResult<T> {
        self.single_or_default::<T>(sql, args)
            .await?
            .ok_or_else(|| DbError::invalid_input("Query returned no rows"))
    }

    /// At most one row; fails when the query returns several.
    pub async fn single_or_default<T: Materializable>(
        &mut self,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Option<T>> {
        let mut items = self.fetch_at_most::<T>(sql, args, 2).await?;
        if items.len() > 1 {
            return Err(DbError::invalid_input("Query returned more than one row"));
        }
        Ok(items.pop())
    }

    /// The first row; fails when the query returns none.
    pub async fn first<T: Materializable>(&mut self, sql: &str, args: &[Arg]) -> DbResult<T> {
        self.first_or_default::<T>(sql, args)
            .await?
            .ok_or_else(|| DbError::invalid_input("Query returned no rows"))
    }

    pub async fn first_or_default<T: Materializable>(
        &mut self,
        sql: &str,
        args: &[Arg],
    ) -> DbResult<Option<T>> {
        Ok(self.fetch_at_most::<T>(sql, args, 1).await?.pop())
    }

    /// The entity whose primary key equals `key`.
    pub async fn single_by_key<T: Entity>(&mut self, key: impl Into<Arg>) -> DbResult<T> {
        let sql = self.by_key_sql::<T>()?;
        self.single::<T>(&sql, &[key.into()]).await
    }

    /// Like [`single_by_key`](Self::single_by_key), but `None` when no row matches.
    pub async fn single_or_default_by_key<T: Entity>(
        &mut self,
        key: impl Into<Arg>,
    ) -> DbResult<Option<T>> {
        let sql = self.by_key_sql::<T>()?;
        self.single_or_default::<T>(&sql, &[key.into()]).await
    }

    fn by_key_sql<T: Entity>(&self) -> DbResult<String> {
        let descriptor = self.context.shapes().descriptor_for::<T>()?;
        let condition = format!(
            "WHERE {}=@0",
            self.escape_sql_identifier(descriptor.primary_key())
        );
        let source = T::select_source(self.context.shapes())?;
        Ok(add_select_clause(&condition, source.as_ref(), self.dialect))
    }

    /// True when a row with primary key `key` exists in `T`'s table.
    pub async fn exists_by_key<T: Entity>(&mut self, key: impl Into<Arg>) -> DbResult<bool> {
        let descriptor = self.context.shapes().descriptor_for::<T>()?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}=@0",
            self.escape_table_name(descriptor.table_name()),
            self.escape_sql_identifier(descriptor.primary_key())
        );
        let count = self.execute_scalar::<i64>(&sql, &[key.into()]).await?;
        Ok(count != 0)
    }

    // =========================================================================
    // Diagnostics and escaping
    // =========================================================================

    /// SQL of the last command, as sent to the driver.
    pub fn last_sql(&self) -> Option<&str> {
        self.last_sql.as_deref()
    }

    /// Parameter values of the last command.
    pub fn last_args(&self) -> &[Value] {
        &self.last_args
    }

    /// The last command formatted for logging.
    pub fn last_command(&self) -> String {
        match &self.last_sql {
            Some(sql) => format_command(self.param_prefix, sql, &self.last_args),
            None => String::new(),
        }
    }

    pub fn escape_sql_identifier(&self, name: &str) -> String {
        self.dialect.escape_identifier(name)
    }

    pub fn escape_table_name(&self, name: &str) -> String {
        self.dialect.escape_table_name(name)
    }

    fn reader(&self) -> ReaderState {
        ReaderState {
            hooks: Arc::clone(&self.hooks),
            context: Arc::clone(&self.context),
            connection_string: self.connection_string.clone(),
            force_utc: self.force_utc,
            last_command: self.last_command(),
        }
    }
}

/// Format a command as its SQL followed by one line per argument.
pub fn format_command(prefix: &str, sql: &str, args: &[Value]) -> String {
    let mut out = String::from(sql);
    for (i, arg) in args.iter().enumerate() {
        let _ = write!(out, "\n\t -> {}{} [{}] = \"{}\"", prefix, i, arg.type_name(), arg);
    }
    out
}

// =============================================================================
// Scoped connection use
// =============================================================================

/// Holds one connection reference for a query stream.
///
/// Released explicitly when the stream finishes; when the stream is dropped
/// early the reference is released on drop, closing the connection without
/// the graceful shutdown.
struct ConnectionScope<'a> {
    db: &'a mut Database,
    released: bool,
}

impl<'a> ConnectionScope<'a> {
    async fn open(db: &'a mut Database) -> DbResult<Self> {
        db.open_shared_connection().await?;
        Ok(Self {
            db,
            released: false,
        })
    }

    async fn release(mut self) -> DbResult<()> {
        self.released = true;
        self.db.close_shared_connection().await
    }
}

impl Deref for ConnectionScope<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl DerefMut for ConnectionScope<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        self.db
    }
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Some(connection) = self.db.release_connection() {
                debug!("Connection released by a dropped query");
                drop(connection);
            }
        }
    }
}

/// Session state a query stream needs while its cursor borrows the connection.
struct ReaderState {
    hooks: Arc<dyn DatabaseHooks>,
    context: Arc<MappingContext>,
    connection_string: String,
    force_utc: bool,
    last_command: String,
}

impl ReaderState {
    fn observe<T>(&self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            self.hooks.on_exception(e, &self.last_command);
        }
        result
    }
}

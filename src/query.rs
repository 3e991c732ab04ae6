//! Read-only cursor over query results.

use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::stream::proto::Query;
use crate::stream::transport::{QueryStream, StreamSink, StreamSource};

/// Streams the results of one query. The server sends a finite result set
/// and then ends the stream.
pub struct QueryCursor {
    stream: Option<QueryStream>,
}

impl QueryCursor {
    pub(crate) fn new(stream: QueryStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Next result, or `None` once the results are exhausted.
    pub async fn fetch_one(&mut self) -> Result<Option<Event>> {
        let stream = self.stream.as_mut().ok_or(Error::CursorClosed)?;
        match stream.source.recv().await? {
            Some(wrapper) => Ok(Some(Event::queried(wrapper)?)),
            None => Ok(None),
        }
    }

    /// Up to `n` further results; fewer when the results run out.
    pub async fn fetch_many(&mut self, n: usize) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(n);
        while events.len() < n {
            match self.fetch_one().await? {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(events)
    }

    /// Every remaining result.
    pub async fn fetch_all(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while let Some(event) = self.fetch_one().await? {
            events.push(event);
        }
        Ok(events)
    }

    /// Half-closes the stream. Later fetches fail with `CursorClosed`.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.sink.close_send().await?;
            debug!(event = "query_cursor_closed");
        }
        Ok(())
    }
}

pub(crate) fn build_query(query: &str, include_duplicates: bool) -> Result<Query> {
    if query.trim().is_empty() {
        return Err(Error::EmptyQuery);
    }
    Ok(Query {
        query: query.to_string(),
        include_duplicates,
    })
}

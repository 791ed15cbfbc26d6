use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::session::{PlayedItem, RemoteSession, bounded};
use crate::watermark::Watermark;

#[derive(Debug, Clone, Copy)]
pub struct HistoryQuery {
    pub after: Option<Watermark>,
    pub page_size: u32,
    pub timeout: Duration,
}

/// Fetches the first history page, then follows `next_cursor` until the remote
/// reports no further page. Items keep page order, then in-page order.
pub async fn fetch_all<S>(session: &S, query: HistoryQuery) -> Result<Vec<PlayedItem>>
where
    S: RemoteSession + ?Sized,
{
    let mut page = bounded(
        query.timeout,
        session.recently_played(query.after, query.page_size),
    )
    .await?;
    let mut items = std::mem::take(&mut page.items);
    let mut seen_cursors = Vec::new();
    while let Some(cursor) = page.next_cursor.take() {
        if seen_cursors.contains(&cursor) {
            return Err(Error::Remote(format!("pagination loops on cursor {cursor}")));
        }
        debug!("Next history page after {} items", items.len());
        page = bounded(query.timeout, session.next_page(&cursor)).await?;
        items.append(&mut page.items);
        seen_cursors.push(cursor);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSession, played};

    fn pages(sizes: &[usize]) -> Vec<Vec<PlayedItem>> {
        let mut n = 0;
        sizes
            .iter()
            .map(|size| {
                (0..*size)
                    .map(|_| {
                        n += 1;
                        played(&format!("Track {n}"), "Artist", n as i64)
                    })
                    .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn merges_every_page_in_order() {
        let session = FakeSession::default().with_history(pages(&[50, 50, 7]));
        let items = fetch_all(
            &session,
            HistoryQuery {
                after: None,
                page_size: 50,
                timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

        assert_eq!(items.len(), 107);
        assert_eq!(session.history_calls(), 3);
        let titles: Vec<_> = items.iter().map(|item| item.track.title.clone()).collect();
        let expected: Vec<_> = (1..=107).map(|n| format!("Track {n}")).collect();
        assert_eq!(titles, expected);
    }

    #[tokio::test]
    async fn single_page_needs_one_call() {
        let session = FakeSession::default().with_history(pages(&[3]));
        let query = HistoryQuery {
            after: None,
            page_size: 50,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(fetch_all(&session, query).await.unwrap().len(), 3);
        assert_eq!(session.history_calls(), 1);
    }

    #[tokio::test]
    async fn a_failing_page_fails_the_whole_fetch() {
        let session = FakeSession::default()
            .with_history(pages(&[50, 50, 7]))
            .failing_page(1);
        let query = HistoryQuery {
            after: None,
            page_size: 50,
            timeout: Duration::from_secs(5),
        };
        let err = fetch_all(&session, query).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(session.history_calls(), 2);
    }
}

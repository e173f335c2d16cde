//! Parser for the public channel web preview (`https://t.me/s/<handle>`).
//!
//! The preview page lists the most recent ~20 posts of a public channel,
//! oldest first. Older pages are reached with `?before=<message_id>`.

use std::future::Future;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::ChannelError;

/// One post scraped from a preview page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewPost {
    pub message_id: i64,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

static RE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<div class="tgme_widget_message_text[^"]*js-message_text[^"]*"[^>]*>(.*?)</div>"#,
    )
    .expect("text pattern is valid")
});

static RE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<time[^>]*datetime="([^"]+)""#).expect("time pattern is valid"));

static RE_BR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("br pattern is valid"));

static RE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag pattern is valid"));

/// Preview page URL for `handle` (without `@`), optionally before a message id.
pub fn preview_url(base: &str, handle: &str, before: Option<i64>) -> String {
    let base = base.trim_end_matches('/');
    match before {
        Some(id) => format!("{base}/s/{handle}?before={id}"),
        None => format!("{base}/s/{handle}"),
    }
}

/// Extract all posts from one preview page, in page order.
///
/// Posts without a parseable timestamp or id are dropped.
pub fn parse_preview_page(html: &str) -> Vec<PreviewPost> {
    let mut posts = Vec::new();

    // Every post container carries `data-post="<handle>/<id>"`.
    for segment in html.split("data-post=\"").skip(1) {
        let Some(end) = segment.find('"') else {
            continue;
        };
        let Some(message_id) = segment[..end]
            .rsplit('/')
            .next()
            .and_then(|id| id.parse::<i64>().ok())
        else {
            continue;
        };

        let Some(timestamp) = RE_TIME
            .captures(segment)
            .and_then(|c| DateTime::parse_from_rfc3339(&c[1]).ok())
            .map(|dt| dt.with_timezone(&Utc))
        else {
            tracing::debug!(message_id, "Preview post without timestamp; skipping");
            continue;
        };

        let text = RE_TEXT
            .captures(segment)
            .map(|c| html_to_text(&c[1]))
            .filter(|t| !t.is_empty());

        posts.push(PreviewPost {
            message_id,
            text,
            timestamp,
        });
    }

    posts
}

/// Convert message HTML to plain text: line breaks kept, tags dropped,
/// entities decoded.
pub fn html_to_text(html: &str) -> String {
    let with_breaks = RE_BR.replace_all(html, "\n");
    let stripped = RE_TAGS.replace_all(&with_breaks, "");
    html_escape::decode_html_entities(&stripped).trim().to_string()
}

/// Walk preview pages from the newest backwards and keep posts at or
/// after `since`, oldest first.
///
/// `fetch_page` receives the `before` cursor (`None` for the newest page).
/// The walk stops at the first page reaching past `since`, at message 1,
/// on an empty or repeated page, or after `max_pages` pages.
pub async fn collect_window<F, Fut>(
    since: DateTime<Utc>,
    max_pages: usize,
    mut fetch_page: F,
) -> Result<Vec<PreviewPost>, ChannelError>
where
    F: FnMut(Option<i64>) -> Fut,
    Fut: Future<Output = Result<Vec<PreviewPost>, ChannelError>>,
{
    let mut collected = Vec::new();
    let mut before: Option<i64> = None;

    for _ in 0..max_pages {
        let page = fetch_page(before).await?;

        let Some(oldest) = page.iter().map(|p| p.message_id).min() else {
            break;
        };
        let reached_window_start = page.iter().any(|p| p.timestamp < since);

        collected.extend(page.into_iter().filter(|p| p.timestamp >= since));

        if reached_window_start || oldest <= 1 || before == Some(oldest) {
            break;
        }
        before = Some(oldest);
    }

    collected.sort_by_key(|p| p.message_id);
    collected.dedup_by_key(|p| p.message_id);
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn post_html(id: i64, text: Option<&str>, datetime: &str) -> String {
        let body = text
            .map(|t| {
                format!(r#"<div class="tgme_widget_message_text js-message_text" dir="auto">{t}</div>"#)
            })
            .unwrap_or_default();
        format!(
            r#"<div class="tgme_widget_message_wrap js-widget_message_wrap">
<div class="tgme_widget_message text_not_supported_wrap js-widget_message" data-post="example/{id}" data-view="x">
<div class="tgme_widget_message_bubble">{body}
<div class="tgme_widget_message_footer"><a class="tgme_widget_message_date" href="https://t.me/example/{id}"><time datetime="{datetime}" class="time">12:00</time></a></div>
</div></div></div>"#
        )
    }

    #[test]
    fn parses_posts_in_page_order() {
        let html = format!(
            "<html><body>{}{}</body></html>",
            post_html(10, Some("Selling, $4500 OBO"), "2026-03-01T10:00:00+00:00"),
            post_html(11, Some("Second"), "2026-03-01T11:30:00+00:00"),
        );
        let posts = parse_preview_page(&html);

        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].message_id, 10);
        assert_eq!(posts[0].text.as_deref(), Some("Selling, $4500 OBO"));
        assert_eq!(posts[1].message_id, 11);
        assert_eq!(
            posts[1].timestamp,
            DateTime::parse_from_rfc3339("2026-03-01T11:30:00Z").unwrap()
        );
    }

    #[test]
    fn media_only_post_has_no_text() {
        let html = post_html(5, None, "2026-03-01T10:00:00+00:00");
        let posts = parse_preview_page(&html);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, None);
    }

    #[test]
    fn post_without_time_is_dropped() {
        let html = r#"<div data-post="example/3"><div class="tgme_widget_message_text js-message_text">x</div></div>"#;
        assert!(parse_preview_page(html).is_empty());
    }

    #[test]
    fn markup_is_converted_to_text() {
        let text = html_to_text("Toyota <b>Camry</b><br/>Price: 7&#036;000 &amp; up<br>call <a href=\"tel:1\">me</a>");
        assert_eq!(text, "Toyota Camry\nPrice: 7$000 & up\ncall me");
    }

    #[test]
    fn preview_urls() {
        assert_eq!(preview_url("https://t.me", "example", None), "https://t.me/s/example");
        assert_eq!(
            preview_url("https://t.me/", "example", Some(120)),
            "https://t.me/s/example?before=120"
        );
    }

    #[test]
    fn empty_page_has_no_posts() {
        assert!(parse_preview_page("<html></html>").is_empty());
    }

    // ── Paging ──────────────────────────────────────────────────────

    fn at(hours_ago: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600, 0).unwrap() - chrono::Duration::hours(hours_ago)
    }

    /// Page of posts `first..=last`, one hour apart, `last` newest.
    fn page(first: i64, last: i64, newest_hours_ago: i64) -> Vec<PreviewPost> {
        (first..=last)
            .map(|id| PreviewPost {
                message_id: id,
                text: Some(format!("post {id}")),
                timestamp: at(newest_hours_ago + (last - id)),
            })
            .collect()
    }

    #[tokio::test]
    async fn walks_back_until_the_window_start() {
        let pages = HashMap::from([
            (None, page(31, 40, 0)),
            (Some(31), page(21, 30, 10)),
            (Some(21), page(11, 20, 20)),
            (Some(11), page(1, 10, 30)),
        ]);
        let mut requested = Vec::new();

        let posts = collect_window(at(25), 50, |before| {
            requested.push(before);
            let page = pages.get(&before).cloned().unwrap_or_default();
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(requested, vec![None, Some(31), Some(21)]);
        let ids: Vec<i64> = posts.iter().map(|p| p.message_id).collect();
        assert_eq!(ids, (15..=40).collect::<Vec<_>>());
        assert!(posts.iter().all(|p| p.timestamp >= at(25)));
    }

    #[tokio::test]
    async fn stops_at_the_first_message() {
        let pages = HashMap::from([(None, page(6, 10, 0)), (Some(6), page(1, 5, 5))]);
        let mut calls = 0;

        let posts = collect_window(at(1000), 50, |before| {
            calls += 1;
            let page = pages.get(&before).cloned().unwrap_or_default();
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(posts.len(), 10);
        assert_eq!(posts.first().unwrap().message_id, 1);
    }

    #[tokio::test]
    async fn repeated_page_ends_the_walk_without_duplicates() {
        let mut calls = 0;

        let posts = collect_window(at(1000), 50, |_| {
            calls += 1;
            let page = page(20, 30, 0);
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(posts.len(), 11);
    }

    #[tokio::test]
    async fn page_cap_bounds_the_walk() {
        let mut calls = 0;

        let posts = collect_window(at(100_000), 3, |before| {
            calls += 1;
            let last = before.map_or(1000, |b| b - 1);
            let page = page(last - 9, last, 0);
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(posts.len(), 30);
    }

    #[tokio::test]
    async fn empty_page_yields_nothing() {
        let posts = collect_window(at(10), 50, |_| async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn fetch_error_is_returned() {
        let result = collect_window(at(10), 50, |_| async {
            Err(ChannelError::HistoryFailed {
                name: "telegram".into(),
                source_id: "@example".into(),
                reason: "preview returned 502".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(ChannelError::HistoryFailed { .. })));
    }
}

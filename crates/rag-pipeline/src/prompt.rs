//! 上下文构造：图片说明/OCR 注入与模板渲染。

use chrono::{DateTime, Datelike, Utc};
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use rag_core::ImageInfo;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::event::PluginError;

/// markdown 图片链接 ![alt](url)
static MARKDOWN_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("valid image regex"));

const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// 将图片说明与 OCR 文本合入段落正文。
/// 正文中出现的 markdown 图片链接后追加 caption/OCR 两行；
/// 只存在于 image_info 的图片集中放到末尾的补充块。
pub fn enrich_content_with_image_info(content: &str, image_info_json: &str) -> String {
    if image_info_json.is_empty() {
        return content.to_string();
    }
    let image_infos: Vec<ImageInfo> = match serde_json::from_str(image_info_json) {
        Ok(infos) => infos,
        Err(err) => {
            warn!(error = %err, "failed to parse image info, using content only");
            return content.to_string();
        }
    };
    if image_infos.is_empty() {
        return content.to_string();
    }

    let mut by_url: HashMap<&str, &ImageInfo> = HashMap::new();
    for info in &image_infos {
        if !info.url.is_empty() {
            by_url.insert(info.url.as_str(), info);
        }
        if !info.original_url.is_empty() {
            by_url.insert(info.original_url.as_str(), info);
        }
    }

    let mut processed: HashMap<String, bool> = HashMap::new();
    let mut content = content.to_string();

    let matches: Vec<(String, String)> = MARKDOWN_IMAGE_RE
        .captures_iter(&content)
        .map(|caps| (caps[0].to_string(), caps[2].to_string()))
        .collect();
    debug!(count = matches.len(), "markdown image links found in passage");

    for (link, url) in &matches {
        processed.insert(url.clone(), true);
        let Some(info) = by_url.get(url.as_str()) else {
            continue;
        };
        let mut replacement = format!("{}\n", link);
        if !info.caption.is_empty() {
            replacement.push_str(&format!("Image caption: {}\n", info.caption));
        }
        if !info.ocr_text.is_empty() {
            replacement.push_str(&format!("Image text: {}\n", info.ocr_text));
        }
        content = content.replacen(link.as_str(), &replacement, 1);
    }

    let mut additional = Vec::new();
    for info in &image_infos {
        if processed.contains_key(&info.url) || processed.contains_key(&info.original_url) {
            continue;
        }
        if !info.caption.is_empty() {
            additional.push(format!("Image {} caption: {}", info.url, info.caption));
        }
        if !info.ocr_text.is_empty() {
            additional.push(format!("Image {} text: {}", info.url, info.ocr_text));
        }
    }
    if !additional.is_empty() {
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str("Additional image information:\n");
        content.push_str(&additional.join("\n"));
    }

    content
}

/// 渲染会话上下文模板。
/// 模板字段：Query / Contexts / CurrentTime / CurrentWeek。
pub fn render_context_template(
    template: &str,
    query: &str,
    passages: &[String],
    now: DateTime<Utc>,
) -> Result<String, PluginError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    registry
        .register_template_string("context", template)
        .map_err(|e| PluginError::template_parse(e.to_string()))?;

    let data = json!({
        "Query": query,
        "Contexts": passages,
        "CurrentTime": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "CurrentWeek": WEEKDAY_NAMES[now.weekday().num_days_from_sunday() as usize],
    });
    registry
        .render("context", &data)
        .map_err(|e| PluginError::template_execute(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn image_info_json() -> String {
        serde_json::to_string(&vec![
            ImageInfo {
                url: "https://cos.example.com/a.png".into(),
                original_url: "https://origin.example.com/a.png".into(),
                caption: "A diagram of the solar system".into(),
                ocr_text: "Sun Mercury Venus".into(),
                ..Default::default()
            },
            ImageInfo {
                url: "https://cos.example.com/b.png".into(),
                caption: "An unrelated chart".into(),
                ..Default::default()
            },
        ])
        .unwrap()
    }

    #[test]
    fn inline_image_gets_caption_and_ocr_lines() {
        let content = "Planets overview ![diagram](https://cos.example.com/a.png) end.";
        let enriched = enrich_content_with_image_info(content, &image_info_json());
        assert!(enriched.contains("![diagram](https://cos.example.com/a.png)\n"));
        assert!(enriched.contains("Image caption: A diagram of the solar system"));
        assert!(enriched.contains("Image text: Sun Mercury Venus"));
    }

    #[test]
    fn images_missing_from_content_go_to_additional_block() {
        let content = "No inline images here.";
        let enriched = enrich_content_with_image_info(content, &image_info_json());
        assert!(enriched.contains("Additional image information:"));
        assert!(enriched.contains("Image https://cos.example.com/a.png caption:"));
        assert!(enriched.contains("Image https://cos.example.com/b.png caption: An unrelated chart"));
    }

    #[test]
    fn invalid_image_json_returns_content_unchanged() {
        let content = "Plain text.";
        assert_eq!(
            enrich_content_with_image_info(content, "{not json"),
            content
        );
    }

    #[test]
    fn template_renders_all_fields() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 8, 30, 0).unwrap(); // Monday
        let rendered = render_context_template(
            "Time: {{CurrentTime}} {{CurrentWeek}}\n{{#each Contexts}}[{{this}}]{{/each}}\nQ: {{Query}}",
            "what is a comet",
            &["passage one".to_string(), "passage two".to_string()],
            now,
        )
        .unwrap();
        assert!(rendered.contains("Time: 2025-06-02 08:30:00 Monday"));
        assert!(rendered.contains("[passage one][passage two]"));
        assert!(rendered.contains("Q: what is a comet"));
    }

    #[test]
    fn malformed_template_is_a_parse_error() {
        let err = render_context_template("{{#each Contexts}}", "q", &[], Utc::now()).unwrap_err();
        assert!(matches!(
            err.error,
            rag_error::RagError::TemplateParse { .. }
        ));
    }
}

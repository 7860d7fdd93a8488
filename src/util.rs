use std::{
    io,
    path::PathBuf,
    time::{Instant, SystemTime},
};

use chrono::{DateTime, Local, Utc};
use log::info;

use crate::param::reason_phrase;

/// 生成服务端自带的简单 HTML 页面（错误页、目录列表）。
pub struct HtmlBuilder {
    title: String,
    css: String,
    body: String,
}

impl HtmlBuilder {
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let description = match note {
            Some(n) => n,
            None => reason_phrase(code),
        };
        let css = r"
            body {
                width: 35em;
                margin: 0 auto;
                font-family: Tahoma, Verdana, Arial, sans-serif;
            }
            "
        .to_string();
        Self {
            title: code.to_string(),
            css,
            body: format!("<h1>{}</h1>\n<p>{}</p>", code, description),
        }
    }

    /// 目录列表页。`url_path` 是浏览器看到的路径，条目链接相对于它。
    pub fn from_dir(url_path: &str, dir_vec: &mut Vec<PathBuf>) -> io::Result<Self> {
        sort_dir_entries(dir_vec);
        let shown = url_path.trim_end_matches('/');

        let mut body = String::new();
        body.push_str(&format!("<h1>{}/ 的文件列表</h1><hr>", escape_html(shown)));
        body.push_str("<table>");
        body.push_str(
            r#"
            <tr><td>文件名</td><td>大小</td><td>修改时间</td></tr>
            <tr><td><a href="../">..</a></td><td></td><td></td></tr>
            "#,
        );
        for entry in dir_vec.iter() {
            let metadata = entry.metadata()?;
            let local_time: DateTime<Local> = metadata.modified()?.into();
            let formatted_time = local_time.format("%Y-%m-%d %H:%M:%S").to_string();
            let filename = match entry.file_name() {
                Some(f) => f.to_string_lossy().to_string(),
                None => continue,
            };
            let (href, size) = if metadata.is_dir() {
                (format!("{}/", filename), "文件夹".to_string())
            } else {
                (filename.clone(), format_file_size(metadata.len()))
            };
            body.push_str(&format!(
                r#"<tr><td><a href="{}">{}</a></td><td>{}</td><td>{}</td></tr>"#,
                urlencoding::encode(&href).replace("%2F", "/"),
                escape_html(&href),
                size,
                formatted_time
            ));
        }
        body.push_str("</table>");

        Ok(HtmlBuilder {
            title: format!("{}/ 的文件列表", escape_html(shown)),
            css: r"
            table { border-collapse: collapse; width: 100%; }
            td, th { padding: 8px; white-space: pre-wrap; border: none; }"
                .to_string(),
            body,
        })
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
<html>
    <head>
        <meta charset="utf-8">
        <title>{}</title>
        <style>{}</style>
    </head>
    <body>
    {}
    </body>
</html>"##,
            self.title, self.css, self.body
        )
    }
}

pub fn format_file_size(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, units[unit_index])
}

// 目录在前，其余按名称排序
fn sort_dir_entries(vec: &mut [PathBuf]) {
    vec.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.cmp(b),
    });
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// 取 `s` 末尾 `max_len` 个字符；不足时在末尾补空格，发生截断时在前面加 `prefix`。
pub fn last_slice(s: &str, max_len: usize, prefix: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    if len > max_len {
        let keep = max_len.saturating_sub(prefix.chars().count());
        let tail: String = chars[len - keep..].iter().collect();
        format!("{}{}", prefix, tail)
    } else {
        format!("{:<width$}", s, width = max_len)
    }
}

/// 调试模式下的访问日志：`方法|耗时|路径 附加标签`
pub fn service_log(method: &str, begin: Instant, path: &str, ext: &str) {
    info!(
        "{}|{:>12}|{} {}",
        last_slice(method, 4, ""),
        format!("{:?}", begin.elapsed()),
        path,
        ext
    );
}

/// IMF-fixdate 格式，例如 `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_date(s: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(s.trim())
        .ok()
        .map(|d| SystemTime::from(d.with_timezone(&Utc)))
}

// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由
//!
//! 前缀匹配的路由表：以 `/` 结尾的模式匹配整棵子树，其余模式只做精确匹配，
//! 多个模式同时匹配时取最长者，`/` 匹配所有未注册的路径。

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};

use crate::{
    request::Request, response::ResponseWriter, server::AppState, util::HtmlBuilder,
};

/// 路由表中的处理器
pub trait Handler: Send + Sync {
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(&Arc<AppState>, &Request, &mut dyn ResponseWriter) + Send + Sync,
{
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        self(state, request, w)
    }
}

/// 路由查找结果
pub enum Route<'r> {
    Found(&'r str, &'r Arc<dyn Handler>),
    Redirect(String),
    NotFound,
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重复注册同一模式时替换旧的处理器
    pub fn insert(&mut self, pattern: &str, handler: Arc<dyn Handler>) {
        if !pattern.starts_with('/') {
            warn!("路由模式 {} 不以 / 开头", pattern);
        }
        if self.routes.insert(pattern.to_string(), handler).is_some() {
            warn!("路由 {} 被重复注册，旧的处理器已被替换", pattern);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.routes.contains_key(pattern)
    }

    /// 最长匹配
    fn matches(&self, path: &str) -> Option<(&str, &Arc<dyn Handler>)> {
        self.routes
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, path))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(pattern, handler)| (pattern.as_str(), handler))
    }

    pub fn lookup(&self, path: &str) -> Route<'_> {
        let cleaned = clean_path(path);
        if cleaned != path {
            return Route::Redirect(cleaned);
        }
        // 只注册了 /dir/ 时，/dir 跳转到 /dir/
        if !path.ends_with('/') && !self.routes.contains_key(path) {
            let with_slash = format!("{}/", path);
            if self.routes.contains_key(&with_slash) {
                return Route::Redirect(with_slash);
            }
        }
        match self.matches(path) {
            Some((pattern, handler)) => Route::Found(pattern, handler),
            None => Route::NotFound,
        }
    }

    pub fn dispatch(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        match self.lookup(request.path()) {
            Route::Found(pattern, handler) => {
                debug!("[ID{}]路由 {} -> {}", request.id(), request.path(), pattern);
                handler.serve(state, request, w);
            }
            Route::Redirect(mut location) => {
                if !request.query().is_empty() {
                    location.push('?');
                    location.push_str(request.query());
                }
                debug!("[ID{}]路由跳转 {} -> {}", request.id(), request.path(), location);
                redirect(w, &location, 301);
            }
            Route::NotFound => {
                debug!("[ID{}]没有匹配的路由: {}", request.id(), request.path());
                w.headers().set("Content-Type", "text/html; charset=utf-8");
                w.write_header(404);
                w.write_str(&HtmlBuilder::from_status_code(404, None).build());
            }
        }
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.ends_with('/') {
        path.starts_with(pattern)
    } else {
        path == pattern
    }
}

/// 写出跳转响应
pub fn redirect(w: &mut dyn ResponseWriter, location: &str, code: u16) {
    w.headers().set("Location", location);
    w.headers().set("Content-Type", "text/html; charset=utf-8");
    w.write_header(code);
    w.write_str(&format!("<a href=\"{}\">Moved Permanently</a>.\n", location));
}

/// 规范化路径：合并重复的 `/`，消去 `.` 与 `..`，保留结尾的 `/`
pub fn clean_path(path: &str) -> String {
    if path.is_empty() || path == "*" {
        return "/".to_string();
    }
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut cleaned = format!("/{}", parts.join("/"));
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if trailing && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, param::HttpRequestMethod, response::Response};
    use proptest::prelude::*;

    fn named(name: &'static str) -> Arc<dyn Handler> {
        Arc::new(
            move |_: &Arc<AppState>, _: &Request, w: &mut dyn ResponseWriter| w.write_str(name),
        )
    }

    fn router() -> Router {
        let mut r = Router::new();
        r.insert("/", named("root"));
        r.insert("/static/", named("static"));
        r.insert("/static/img/", named("img"));
        r.insert("/about", named("about"));
        r.insert("/docs/", named("docs"));
        r
    }

    fn found(r: &Router, path: &str) -> Option<String> {
        match r.lookup(path) {
            Route::Found(p, _) => Some(p.to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let r = router();
        assert_eq!(found(&r, "/static/a.css").as_deref(), Some("/static/"));
        assert_eq!(found(&r, "/static/img/a.png").as_deref(), Some("/static/img/"));
        assert_eq!(found(&r, "/about").as_deref(), Some("/about"));
        assert_eq!(found(&r, "/about/more").as_deref(), Some("/"));
        assert_eq!(found(&r, "/nothing").as_deref(), Some("/"));
    }

    #[test]
    fn test_directory_redirect() {
        let r = router();
        assert!(matches!(r.lookup("/docs"), Route::Redirect(l) if l == "/docs/"));
        assert!(matches!(r.lookup("/a//b/../c"), Route::Redirect(l) if l == "/a/c"));
    }

    #[test]
    fn test_not_found_without_catch_all() {
        let mut r = Router::new();
        r.insert("/only", named("only"));
        let state = Arc::new(AppState::new(Config::new()).unwrap());
        let mut resp = Response::new();
        r.dispatch(&state, &Request::new(HttpRequestMethod::Get, "/else"), &mut resp);
        assert_eq!(resp.status_code(), 404);
        assert!(String::from_utf8_lossy(resp.body()).contains("<h1>404</h1>"));
    }

    #[test]
    fn test_dispatch_and_replace() {
        let mut r = router();
        r.insert("/about", named("about-v2"));
        assert_eq!(r.len(), 5);
        let state = Arc::new(AppState::new(Config::new()).unwrap());

        let mut resp = Response::new();
        r.dispatch(&state, &Request::new(HttpRequestMethod::Get, "/about"), &mut resp);
        assert_eq!(resp.body(), b"about-v2");

        let mut resp = Response::new();
        r.dispatch(&state, &Request::new(HttpRequestMethod::Get, "/docs?x=1"), &mut resp);
        assert_eq!(resp.status_code(), 301);
        assert_eq!(resp.header("Location"), Some("/docs/?x=1"));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/a/./b/"), "/a/b/");
        assert_eq!(clean_path("/../x"), "/x");
        assert_eq!(clean_path("/a/b/.."), "/a/");
    }

    proptest! {
        #[test]
        fn prop_match_is_longest_registered_prefix(segs in prop::collection::vec("[a-c]{1,2}", 1..5)) {
            let path = format!("/{}", segs.join("/"));
            let mut r = Router::new();
            r.insert("/", named("root"));
            let mut prefix = String::from("/");
            for s in &segs[..segs.len() - 1] {
                prefix.push_str(s);
                prefix.push('/');
                r.insert(&prefix, named("dir"));
            }
            let expected = if segs.len() > 1 { prefix.clone() } else { "/".to_string() };
            prop_assert_eq!(found(&r, &path), Some(expected));
        }

        #[test]
        fn prop_clean_path_is_idempotent(path in "(/[a-z.]{0,3}){0,6}/?") {
            let once = clean_path(&path);
            prop_assert!(once.starts_with('/'));
            prop_assert_eq!(clean_path(&once), once.clone());
        }
    }
}

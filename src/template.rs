// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 模板缓存模块
//!
//! 按文件路径缓存已编译的 HTML 模板，文件修改时间变化时整体重新编译。
//!
//! ## 并发模型
//! - 整个映射表由一把互斥锁保护，锁的范围覆盖“查询修改时间 + 必要时重新编译”；
//! - 返回给调用方的是 `Arc<CachedTemplate>`，渲染在锁外进行，互不阻塞；
//! - 编译失败时旧条目保持不变，下次请求会再次尝试编译。
//!
//! ## include
//! 每个模板都注册了 `include(file=..., ...)` 函数。`file` 相对于**发起包含的模板**
//! 所在目录解析，其余参数作为被包含模板的上下文。父模板的上下文不会自动传入，
//! 需要页面数据时显式传参，例如 `include(file="x.html", data=data)`。由于渲染发生在锁外，
//! 嵌套包含不会重入互斥锁。

use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::SystemTime,
};

use log::{debug, info, warn};
use serde::Serialize;
use tera::{Context, Function, Tera, Value};

use crate::exception::Exception;

/// 已经编译的模板对象。
///
/// 修改时间与编译结果总是一起被替换，读者不会观察到不一致的组合。
pub struct CachedTemplate {
    source_path: PathBuf,
    name: String,
    last_modified: SystemTime,
    compiled: Tera,
}

impl CachedTemplate {
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// 模板在编译结果中注册的名称（即源文件路径）
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// 模板文件所在目录，`include` 以它为基准
    pub fn dirname(&self) -> String {
        parent_dir(&self.source_path).to_string_lossy().to_string()
    }

    pub fn render(&self, context: &Context) -> Result<String, Exception> {
        Ok(self.compiled.render(&self.name, context)?)
    }

    /// 构造页面的渲染上下文：`data` 为处理函数返回的数据，
    /// `dirname`、`template` 为辅助字段。
    pub fn page_context<T: Serialize + ?Sized>(&self, data: &T) -> Context {
        let mut context = Context::new();
        context.insert("data", data);
        context.insert("dirname", &self.dirname());
        context.insert("template", &self.name);
        context
    }
}

/// 所有模板共享的函数表，在开始服务之前注册完毕。
#[derive(Clone, Default)]
pub struct TemplateFunctions {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl TemplateFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: Function + 'static>(&mut self, name: &str, function: F) {
        if name == "include" {
            warn!("模板函数 include 由模板缓存提供，注册将被忽略");
            return;
        }
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

struct SharedFunction(Arc<dyn Function>);

impl Function for SharedFunction {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        self.0.call(args)
    }

    fn is_safe(&self) -> bool {
        self.0.is_safe()
    }
}

struct IncludeFunction {
    cache: Weak<TemplateCache>,
    dirname: PathBuf,
    parent: String,
}

impl Function for IncludeFunction {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let file = match args.get("file") {
            Some(Value::String(s)) => s,
            _ => return Err(tera::Error::msg("include 需要字符串参数 `file`")),
        };
        let cache = self
            .cache
            .upgrade()
            .ok_or_else(|| tera::Error::msg("模板缓存已经被释放"))?;

        let path = self.dirname.join(file);
        let template = cache
            .resolve(&path)
            .map_err(|e| tera::Error::chain(format!("include {}", path.display()), e))?;

        let mut context = Context::new();
        for (key, value) in args.iter().filter(|(k, _)| k.as_str() != "file") {
            context.insert(key.as_str(), value);
        }
        context.insert("dirname", &template.dirname());
        context.insert("template", &self.parent);

        let html = template
            .render(&context)
            .map_err(|e| tera::Error::chain(format!("render {}", path.display()), e))?;
        Ok(Value::String(html))
    }

    // 被包含模板已经完成了自己的转义
    fn is_safe(&self) -> bool {
        true
    }
}

pub struct TemplateCache {
    entries: Mutex<HashMap<PathBuf, Arc<CachedTemplate>>>,
    functions: TemplateFunctions,
    weak_self: Weak<TemplateCache>,
}

impl TemplateCache {
    pub fn new(functions: TemplateFunctions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entries: Mutex::new(HashMap::new()),
            functions,
            weak_self: weak.clone(),
        })
    }

    /// 编译并返回模板对象，如果模板文件有变更会重新编译。
    ///
    /// 文件不存在等 I/O 错误原样返回；修改时间未变时直接返回同一个 `Arc`。
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<Arc<CachedTemplate>, Exception> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let modified = file.metadata()?.modified()?;

        let mut entries = self.lock();
        if let Some(cached) = entries.get(path) {
            if cached.last_modified == modified {
                debug!("模板缓存命中: {}", path.display());
                return Ok(Arc::clone(cached));
            }
        }

        info!("Template change {}", path.display());
        let mut source = String::new();
        file.read_to_string(&mut source)?;
        let name = path.to_string_lossy().to_string();
        let compiled = self.compile(path, &name, &source)?;

        let cached = Arc::new(CachedTemplate {
            source_path: path.to_path_buf(),
            name,
            last_modified: modified,
            compiled,
        });
        entries.insert(path.to_path_buf(), Arc::clone(&cached));
        Ok(cached)
    }

    fn compile(&self, path: &Path, name: &str, source: &str) -> Result<Tera, Exception> {
        let mut tera = Tera::default();
        for (fname, function) in self.functions.functions.iter() {
            tera.register_function(fname, SharedFunction(Arc::clone(function)));
        }
        tera.register_function(
            "include",
            IncludeFunction {
                cache: self.weak_self.clone(),
                dirname: parent_dir(path).to_path_buf(),
                parent: name.to_string(),
            },
        );
        tera.add_raw_template(name, source)?;
        Ok(tera)
    }

    /// 缓存中记录的修改时间
    pub fn last_modified(&self, path: impl AsRef<Path>) -> Option<SystemTime> {
        self.lock().get(path.as_ref()).map(|c| c.last_modified)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<CachedTemplate>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("模板缓存锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

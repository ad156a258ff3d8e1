//! Import resolution from language-specific import records to module names.
//!
//! Targets are modules, not files: a module is internal when some indexed
//! file declares it and external otherwise. Every import resolves to one of
//! the two; nothing is dropped.

use std::collections::HashMap;

use crate::models::{ImportKind, ImportRef, Language};

/// Modules declared by indexed files.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: HashMap<String, Language>,
}

impl ModuleCatalog {
    pub fn new<I, S>(declared: I) -> Self
    where
        I: IntoIterator<Item = (S, Language)>,
        S: Into<String>,
    {
        Self {
            modules: declared.into_iter().map(|(m, l)| (m.into(), l)).collect(),
        }
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn language(&self, module: &str) -> Option<Language> {
        self.modules.get(module).copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn declared(&self, module: &str) -> Option<String> {
        self.contains(module).then(|| module.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleTarget {
    Internal(String),
    External(String),
}

impl ModuleTarget {
    pub fn qualified_name(&self) -> &str {
        match self {
            ModuleTarget::Internal(m) | ModuleTarget::External(m) => m,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, ModuleTarget::Internal(_))
    }
}

pub fn import_kind(language: Language, import: &ImportRef) -> ImportKind {
    let relative = import.relative_level > 0
        || (language == Language::TypeScript && import.module.starts_with('.'));
    if relative {
        ImportKind::Relative
    } else {
        ImportKind::Absolute
    }
}

fn python_package(importer_path: &str, importer_module: &str) -> String {
    if importer_path.ends_with("__init__.py") {
        return importer_module.to_string();
    }
    importer_module
        .rsplit_once('.')
        .map(|(package, _)| package.to_string())
        .unwrap_or_default()
}

fn resolve_python(
    importer_path: &str,
    importer_module: &str,
    import: &ImportRef,
    catalog: &ModuleCatalog,
) -> ModuleTarget {
    if import.relative_level == 0 {
        return match catalog.declared(&import.module) {
            Some(m) => ModuleTarget::Internal(m),
            None => ModuleTarget::External(import.module.clone()),
        };
    }
    let mut package = python_package(importer_path, importer_module);
    for _ in 1..import.relative_level {
        if package.is_empty() {
            let dots = ".".repeat(import.relative_level as usize);
            return ModuleTarget::External(format!("{dots}{}", import.module));
        }
        package = package
            .rsplit_once('.')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_default();
    }
    let target = match (package.is_empty(), import.module.is_empty()) {
        (true, _) => import.module.clone(),
        (false, true) => package,
        (false, false) => format!("{package}.{}", import.module),
    };
    if target.is_empty() {
        return ModuleTarget::External(".".repeat(import.relative_level as usize));
    }
    match catalog.declared(&target) {
        Some(m) => ModuleTarget::Internal(m),
        None => ModuleTarget::External(target),
    }
}

fn strip_script_extension(path: &str) -> &str {
    for ext in [".tsx", ".ts", ".jsx", ".js"] {
        if let Some(stem) = path.strip_suffix(ext) {
            return stem;
        }
    }
    path
}

fn resolve_typescript(importer_path: &str, import: &ImportRef, catalog: &ModuleCatalog) -> ModuleTarget {
    let spec = strip_script_extension(&import.module);
    if !spec.starts_with('.') {
        return match catalog.declared(spec) {
            Some(m) => ModuleTarget::Internal(m),
            None => ModuleTarget::External(import.module.clone()),
        };
    }
    let dir = importer_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    let joined = normalize_posix_path(&format!("{dir}/{spec}"));
    let index = format!("{joined}/index");
    if let Some(m) = catalog.declared(&joined).or_else(|| catalog.declared(&index)) {
        return ModuleTarget::Internal(m);
    }
    ModuleTarget::External(joined)
}

/// Declared Go packages are directories; the import path ends with one.
fn resolve_go(import: &ImportRef, catalog: &ModuleCatalog) -> ModuleTarget {
    let path = import.module.trim_end_matches('/');
    let mut best: Option<&str> = None;
    for module in catalog.modules.keys() {
        let matches = path == module || path.ends_with(&format!("/{module}"));
        if matches && best.map_or(true, |b| module.len() > b.len()) {
            best = Some(module);
        }
    }
    match best {
        Some(m) => ModuleTarget::Internal(m.to_string()),
        None => ModuleTarget::External(path.to_string()),
    }
}

/// Tries the package, then shorter prefixes for static member imports.
fn resolve_java(import: &ImportRef, catalog: &ModuleCatalog) -> ModuleTarget {
    let mut candidate = import.module.as_str();
    loop {
        if let Some(m) = catalog.declared(candidate) {
            return ModuleTarget::Internal(m);
        }
        match candidate.rsplit_once('.') {
            Some((prefix, _)) => candidate = prefix,
            None => break,
        }
    }
    ModuleTarget::External(import.module.clone())
}

pub fn resolve_module(
    language: Language,
    importer_path: &str,
    importer_module: &str,
    import: &ImportRef,
    catalog: &ModuleCatalog,
) -> ModuleTarget {
    match language {
        Language::Python => resolve_python(importer_path, importer_module, import, catalog),
        Language::TypeScript => resolve_typescript(importer_path, import, catalog),
        Language::Go => resolve_go(import, catalog),
        Language::Java => resolve_java(import, catalog),
    }
}

/// `from pkg import mod` names a submodule when `pkg.mod` is declared.
pub fn submodule(
    language: Language,
    base: &ModuleTarget,
    name: &str,
    catalog: &ModuleCatalog,
) -> Option<String> {
    if language != Language::Python || !base.is_internal() {
        return None;
    }
    catalog.declared(&format!("{}.{name}", base.qualified_name()))
}

/// Name an import binds in the importing file when it has no explicit alias.
pub fn default_binding(language: Language, import: &ImportRef) -> String {
    match language {
        Language::Go => import
            .module
            .rsplit('/')
            .next()
            .unwrap_or(&import.module)
            .to_string(),
        _ => import.module.clone(),
    }
}

pub fn normalize_posix_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            _ => stack.push(part),
        }
    }
    stack.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import(module: &str, level: u32) -> ImportRef {
        ImportRef {
            line: 1,
            module: module.to_string(),
            names: Vec::new(),
            alias: None,
            relative_level: level,
            wildcard: false,
        }
    }

    #[test]
    fn test_python_absolute_and_relative() {
        let catalog = ModuleCatalog::new([
            ("auth", Language::Python),
            ("auth.validators", Language::Python),
            ("auth.register", Language::Python),
            ("core.db", Language::Python),
        ]);
        let resolve = |path: &str, module: &str, imp: &ImportRef| {
            resolve_module(Language::Python, path, module, imp, &catalog)
        };
        assert_eq!(
            resolve("auth/register.py", "auth.register", &import("validators", 1)),
            ModuleTarget::Internal("auth.validators".into())
        );
        assert_eq!(
            resolve("auth/__init__.py", "auth", &import("validators", 1)),
            ModuleTarget::Internal("auth.validators".into())
        );
        assert_eq!(
            resolve("auth/register.py", "auth.register", &import("", 1)),
            ModuleTarget::Internal("auth".into())
        );
        assert_eq!(
            resolve("auth/register.py", "auth.register", &import("core.db", 2)),
            ModuleTarget::Internal("core.db".into())
        );
        assert_eq!(
            resolve("auth/register.py", "auth.register", &import("os.path", 0)),
            ModuleTarget::External("os.path".into())
        );
    }

    #[test]
    fn test_python_submodule_detection() {
        let catalog = ModuleCatalog::new([("auth", Language::Python), ("auth.views", Language::Python)]);
        let base = ModuleTarget::Internal("auth".into());
        assert_eq!(
            submodule(Language::Python, &base, "views", &catalog).as_deref(),
            Some("auth.views")
        );
        assert_eq!(submodule(Language::Python, &base, "login", &catalog), None);
    }

    #[test]
    fn test_typescript_relative_and_index() {
        let catalog = ModuleCatalog::new([
            ("src/auth/validators", Language::TypeScript),
            ("src/shared/index", Language::TypeScript),
        ]);
        let resolve =
            |imp: &ImportRef| resolve_module(Language::TypeScript, "src/auth/register.ts", "src/auth/register", imp, &catalog);
        assert_eq!(
            resolve(&import("./validators", 0)),
            ModuleTarget::Internal("src/auth/validators".into())
        );
        assert_eq!(
            resolve(&import("../shared", 0)),
            ModuleTarget::Internal("src/shared/index".into())
        );
        assert_eq!(resolve(&import("react", 0)), ModuleTarget::External("react".into()));
        assert_eq!(
            import_kind(Language::TypeScript, &import("./validators", 0)),
            ImportKind::Relative
        );
    }

    #[test]
    fn test_go_longest_suffix_match() {
        let catalog = ModuleCatalog::new([("server", Language::Go), ("pkg/server", Language::Go)]);
        assert_eq!(
            resolve_module(Language::Go, "main.go", "main", &import("github.com/acme/app/pkg/server", 0), &catalog),
            ModuleTarget::Internal("pkg/server".into())
        );
        assert_eq!(
            resolve_module(Language::Go, "main.go", "main", &import("fmt", 0), &catalog),
            ModuleTarget::External("fmt".into())
        );
        assert_eq!(default_binding(Language::Go, &import("net/http", 0)), "http");
    }

    #[test]
    fn test_java_package_prefixes() {
        let catalog = ModuleCatalog::new([("com.acme.users", Language::Java)]);
        assert_eq!(
            resolve_module(Language::Java, "A.java", "com.acme", &import("com.acme.users", 0), &catalog),
            ModuleTarget::Internal("com.acme.users".into())
        );
        assert_eq!(
            resolve_module(Language::Java, "A.java", "com.acme", &import("com.acme.users.UserService", 0), &catalog),
            ModuleTarget::Internal("com.acme.users".into())
        );
        assert_eq!(
            resolve_module(Language::Java, "A.java", "com.acme", &import("java.util", 0), &catalog),
            ModuleTarget::External("java.util".into())
        );
    }

    #[test]
    fn test_normalize_posix_path() {
        assert_eq!(normalize_posix_path("src/auth/../shared/./x"), "src/shared/x");
        assert_eq!(normalize_posix_path("/a//b/"), "a/b");
    }
}

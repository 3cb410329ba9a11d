//! 类别注册表 (class name ↔ 稳定整数ID)
//!
//! - 按插入顺序保存, 持久化为数据集根目录下的 `classes.json`
//! - ID 永不复用: 删除的类别ID被退役
//! - `SharedRegistry` 读写锁包装: 写盘线程每次持久化期间持有读锁,
//!   增删改类别因此与样本写入互斥

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlowError, Result};

pub const REGISTRY_FILE: &str = "classes.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClassRegistry {
    next_id: u32,
    classes: Vec<ClassEntry>,
    #[serde(skip)]
    root: Option<PathBuf>,
}

/// 类别名即目录名: 不允许为空、路径分隔符或以 `.` 开头
fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty()
        || name.starts_with('.')
        || name.starts_with('_')
        || name.contains(['/', '\\', ':'])
        || name.chars().any(char::is_control)
    {
        return Err(FlowError::Config(format!("invalid class name '{}'", name)));
    }
    Ok(name)
}

impl ClassRegistry {
    /// 内存中的注册表 (不落盘)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 打开数据集根目录下的注册表; 文件不存在时为空
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let path = root.join(REGISTRY_FILE);
        let mut registry: Self = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Self::default()
        };
        registry.root = Some(root);
        Ok(registry)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn save(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        fs::create_dir_all(root)?;
        let path = root.join(REGISTRY_FILE);
        let tmp = root.join(format!(".{}.tmp", REGISTRY_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn classes(&self) -> &[ClassEntry] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.name_of(id).is_some()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }

    /// 最大ID + 1 (含退役ID, 供训练配置的 `nc` 使用)
    pub fn id_span(&self) -> u32 {
        self.next_id
    }

    /// 添加类别; 同名类别已存在时返回其ID
    pub fn add(&mut self, name: &str) -> Result<u32> {
        let name = validate_name(name)?;
        if let Some(id) = self.id_of(name) {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.classes.push(ClassEntry {
            id,
            name: name.to_string(),
        });
        self.save()?;
        info!("🏷️ 新类别 {} → {}", name, id);
        Ok(id)
    }

    /// 重命名类别 (连同类别目录)
    pub fn rename(&mut self, id: u32, new_name: &str) -> Result<()> {
        let new_name = validate_name(new_name)?.to_string();
        let old_name = self
            .name_of(id)
            .ok_or(FlowError::UnknownClass(id))?
            .to_string();
        if old_name == new_name {
            return Ok(());
        }
        if self.id_of(&new_name).is_some() {
            return Err(FlowError::Config(format!("class '{}' already exists", new_name)));
        }
        if let Some(root) = &self.root {
            let from = root.join(&old_name);
            if from.is_dir() {
                fs::rename(&from, root.join(&new_name))?;
            }
        }
        if let Some(entry) = self.classes.iter_mut().find(|c| c.id == id) {
            entry.name = new_name.clone();
        }
        self.save()?;
        info!("🏷️ 类别 {} 重命名: {} → {}", id, old_name, new_name);
        Ok(())
    }

    /// 删除类别; ID 退役, 已有样本文件保留在磁盘上
    pub fn remove(&mut self, id: u32) -> Result<String> {
        let index = self
            .classes
            .iter()
            .position(|c| c.id == id)
            .ok_or(FlowError::UnknownClass(id))?;
        let entry = self.classes.remove(index);
        self.save()?;
        info!("🏷️ 类别 {} ({}) 已删除, ID 退役", entry.name, id);
        Ok(entry.name)
    }
}

/// 跨线程共享的注册表
#[derive(Clone, Debug)]
pub struct SharedRegistry {
    inner: Arc<RwLock<ClassRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: ClassRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, ClassRegistry>> {
        self.inner
            .read()
            .map_err(|_| FlowError::WriteFailure("class registry lock poisoned".into()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, ClassRegistry>> {
        self.inner
            .write()
            .map_err(|_| FlowError::WriteFailure("class registry lock poisoned".into()))
    }

    /// 当前快照 (显示用, 可能稍旧)
    pub fn snapshot(&self) -> Result<ClassRegistry> {
        Ok(self.read()?.clone())
    }

    pub fn add(&self, name: &str) -> Result<u32> {
        self.write()?.add(name)
    }

    pub fn rename(&self, id: u32, new_name: &str) -> Result<()> {
        self.write()?.rename(id, new_name)
    }

    pub fn remove(&self, id: u32) -> Result<String> {
        self.write()?.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_never_reused() {
        let mut reg = ClassRegistry::in_memory();
        assert_eq!(reg.add("person").unwrap(), 0);
        assert_eq!(reg.add("ball").unwrap(), 1);
        assert_eq!(reg.add("person").unwrap(), 0);
        reg.remove(1).unwrap();
        assert!(!reg.contains(1));
        assert_eq!(reg.add("cup").unwrap(), 2);
        assert_eq!(reg.id_span(), 3);
        let names: Vec<&str> = reg.classes().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["person", "cup"]);
    }

    #[test]
    fn test_persisted_and_rename_moves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = ClassRegistry::open(dir.path()).unwrap();
        let id = reg.add("car").unwrap();
        fs::create_dir_all(dir.path().join("car")).unwrap();
        reg.rename(id, "truck").unwrap();
        assert!(dir.path().join("truck").is_dir());
        assert!(!dir.path().join("car").exists());

        let reopened = ClassRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.name_of(id), Some("truck"));
        assert_eq!(reopened.id_span(), 1);
    }

    #[test]
    fn test_invalid_operations() {
        let mut reg = ClassRegistry::in_memory();
        assert!(reg.add("../escape").is_err());
        assert!(reg.add(".hidden").is_err());
        assert!(reg.add("_background").is_err());
        assert!(reg.add("  ").is_err());
        assert!(matches!(reg.rename(9, "x"), Err(FlowError::UnknownClass(9))));
        let a = reg.add("a").unwrap();
        reg.add("b").unwrap();
        assert!(reg.rename(a, "b").is_err());
    }

    #[test]
    fn test_shared_registry_serializes_mutations() {
        let shared = SharedRegistry::new(ClassRegistry::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = shared.clone();
                std::thread::spawn(move || s.add(&format!("class{}", i)).unwrap())
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }
}

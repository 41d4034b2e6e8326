//! File security validation, secure temporary files, and resource limits
//!
//! Every file passes through the validator before extraction: size gate,
//! extension deny-list, MIME sniffing, a content scan over the leading bytes,
//! and PDF-specific checks. The resource guard enforces process-level memory,
//! CPU-time, and file-descriptor ceilings between pipeline stages.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, System};

use crate::config::{ResourceConfig, SecurityConfig};
use crate::types::{sha256_hex, ErrorKind};

/// Security subsystem errors
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource limit exceeded: {kind}")]
    LimitExceeded { kind: ErrorKind },
}

/// Byte patterns that reject a file outright when found in its head
const SUSPICIOUS_PATTERNS: &[&[u8]] = &[
    b"<script",
    b"javascript:",
    b"vbscript:",
    b"<?php",
    b"<%",
    b"{{",
    b"${",
];

/// Extensions rejected unconditionally
const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".bat", ".cmd", ".com", ".pif", ".vbs", ".js", ".jar", ".app", ".deb",
    ".pkg", ".dmg", ".zip", ".rar", ".7z",
];

/// How many leading bytes the content scan inspects
const CONTENT_SCAN_BYTES: usize = 80 * 1024;

/// Outcome of validating one uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSecurityReport {
    pub is_safe: bool,
    /// 0.0 = clean, 1.0 = dangerous
    pub risk_score: f32,
    pub issues: Vec<String>,
    pub detected_type: Option<String>,
    pub size_compliant: bool,
    pub content_clean: bool,
    pub sha256: Option<String>,
}

impl FileSecurityReport {
    fn rejected(issue: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            risk_score: 1.0,
            issues: vec![issue.into()],
            detected_type: None,
            size_compliant: false,
            content_clean: false,
            sha256: None,
        }
    }
}

/// Validates uploaded files before they enter the pipeline
pub struct FileSecurityValidator {
    config: SecurityConfig,
}

impl FileSecurityValidator {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    /// Run the full validation battery against a file on disk.
    pub fn validate(&self, path: &Path, declared_type: Option<&str>) -> FileSecurityReport {
        let mut issues = Vec::new();
        let mut risk_score: f32 = 0.0;

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return FileSecurityReport::rejected("file does not exist"),
        };

        // Size gate
        let size_compliant = metadata.len() <= self.config.max_file_size_bytes();
        if !size_compliant {
            issues.push(format!(
                "file too large: {:.1}MB > {}MB",
                metadata.len() as f64 / (1024.0 * 1024.0),
                self.config.max_file_size_mb
            ));
            risk_score += 0.3;
        }

        // Extension deny-list
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if DANGEROUS_EXTENSIONS.contains(&extension.as_str()) {
            issues.push(format!("dangerous file extension: {}", extension));
            risk_score += 0.8;
        }

        let head = read_head(path, CONTENT_SCAN_BYTES).unwrap_or_default();

        // MIME verification against the sniffed type
        let detected = sniff_mime(&head, &extension);
        if let Some(declared) = declared_type {
            if let Some(detected) = &detected {
                if declared != detected {
                    issues.push(format!(
                        "MIME type mismatch: declared {}, detected {}",
                        declared, detected
                    ));
                    risk_score += 0.4;
                }
            }
        }
        match &detected {
            Some(detected) if self.allowed_mime_types().contains(detected.as_str()) => {}
            Some(detected) => {
                issues.push(format!("unsupported MIME type: {}", detected));
                risk_score += 0.5;
            }
            None => {
                issues.push("unrecognized file content".to_string());
                risk_score += 0.5;
            }
        }

        // Content scan over the leading bytes
        let content_clean = scan_content(&head);
        if !content_clean {
            issues.push("suspicious content patterns detected".to_string());
            risk_score += 0.6;
        }

        // PDF-specific checks
        if extension == ".pdf" || detected.as_deref() == Some("application/pdf") {
            risk_score += self.validate_pdf(path, &mut issues);
        }

        // Content hash
        let sha256 = match fs::read(path) {
            Ok(bytes) => Some(sha256_hex(&bytes)),
            Err(e) => {
                issues.push(format!("failed to hash file: {}", e));
                risk_score += 0.2;
                None
            }
        };

        let risk_score = risk_score.min(1.0);
        let is_safe = risk_score < 0.5 && issues.is_empty();
        if !is_safe {
            tracing::warn!(
                "File {} failed security validation (risk {:.2}): {:?}",
                path.display(),
                risk_score,
                issues
            );
        }

        FileSecurityReport {
            is_safe,
            risk_score,
            issues,
            detected_type: detected,
            size_compliant,
            content_clean,
            sha256,
        }
    }

    fn allowed_mime_types(&self) -> HashSet<&'static str> {
        self.config
            .allowed_file_types
            .iter()
            .filter_map(|ext| match ext.as_str() {
                "pdf" => Some("application/pdf"),
                "txt" => Some("text/plain"),
                "md" => Some("text/markdown"),
                "doc" => Some("application/msword"),
                "docx" => {
                    Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
                }
                _ => None,
            })
            .collect()
    }

    /// Page-count, embedded JavaScript, and additional-action checks over the
    /// raw PDF bytes.
    fn validate_pdf(&self, path: &Path, issues: &mut Vec<String>) -> f32 {
        let mut risk = 0.0;
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                issues.push(format!("PDF validation error: {}", e));
                return 0.2;
            }
        };

        let page_count = count_pdf_pages(&bytes);
        if page_count > self.config.max_pdf_pages {
            issues.push(format!(
                "PDF has too many pages: {} > {}",
                page_count, self.config.max_pdf_pages
            ));
            risk += 0.3;
        }

        if contains(&bytes, b"/JavaScript") || contains_token(&bytes, b"/JS") {
            issues.push("PDF contains JavaScript".to_string());
            risk += 0.7;
        }

        // Additional-actions dictionaries near the document head
        let head = &bytes[..bytes.len().min(CONTENT_SCAN_BYTES)];
        if contains_token(head, b"/AA") {
            issues.push("PDF contains potentially dangerous actions".to_string());
            risk += 0.5;
        }

        risk
    }
}

fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut buffer = vec![0u8; limit];
    let mut read_total = 0;
    while read_total < limit {
        let n = file.read(&mut buffer[read_total..])?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    buffer.truncate(read_total);
    Ok(buffer)
}

/// Case-insensitive scan of the leading bytes for the suspicious pattern set.
fn scan_content(head: &[u8]) -> bool {
    let lowered: Vec<u8> = head.iter().map(|b| b.to_ascii_lowercase()).collect();
    !SUSPICIOUS_PATTERNS.iter().any(|pattern| contains(&lowered, pattern))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Match a PDF name token (`/JS`, `/AA`) not followed by another name char,
/// so `/JSFoo` does not count.
fn contains_token(haystack: &[u8], token: &[u8]) -> bool {
    haystack.windows(token.len() + 1).any(|window| {
        window.starts_with(token) && !window[token.len()].is_ascii_alphanumeric()
    }) || haystack.ends_with(token)
}

fn count_pdf_pages(bytes: &[u8]) -> usize {
    // "/Type /Page" not followed by 's' distinguishes page objects from the
    // page-tree node.
    let needle = b"/Type /Page";
    bytes
        .windows(needle.len() + 1)
        .filter(|window| window.starts_with(needle) && window[needle.len()] != b's')
        .count()
}

/// Sniff a MIME type from magic bytes, falling back to the extension for
/// plain-text formats.
fn sniff_mime(head: &[u8], extension: &str) -> Option<String> {
    if head.starts_with(b"%PDF-") {
        return Some("application/pdf".to_string());
    }
    if head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return Some("application/msword".to_string());
    }
    if head.starts_with(b"PK\x03\x04") {
        return Some(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
        );
    }
    if head.is_empty() || std::str::from_utf8(head).is_ok() {
        return match extension {
            ".md" => Some("text/markdown".to_string()),
            ".txt" | "" => Some("text/plain".to_string()),
            ".pdf" | ".doc" | ".docx" => None,
            _ => Some("text/plain".to_string()),
        };
    }
    None
}

/// Tracks temporary files and deletes them securely
///
/// Files are created with owner-only permissions inside a private scratch
/// directory. Secure delete overwrites the full length with random bytes
/// before unlinking.
pub struct TempFileManager {
    root: tempfile::TempDir,
    tracked: Mutex<HashSet<PathBuf>>,
}

impl TempFileManager {
    pub fn new() -> Result<Self, SecurityError> {
        let root = tempfile::Builder::new().prefix("ingest_").tempdir()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root.path(), fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            root,
            tracked: Mutex::new(HashSet::new()),
        })
    }

    pub fn create_temp_file(&self, suffix: &str) -> Result<PathBuf, SecurityError> {
        let name = format!("scratch-{}{}", uuid::Uuid::new_v4(), suffix);
        let path = self.root.path().join(name);
        let file = fs::File::create(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        drop(file);
        self.tracked.lock().insert(path.clone());
        tracing::debug!("Created secure temp file {}", path.display());
        Ok(path)
    }

    pub fn write_temp_file(&self, suffix: &str, contents: &[u8]) -> Result<PathBuf, SecurityError> {
        let path = self.create_temp_file(suffix)?;
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Overwrite with random bytes, then unlink.
    pub fn secure_delete(&self, path: &Path) -> Result<(), SecurityError> {
        if path.exists() {
            let len = fs::metadata(path)?.len() as usize;
            if len > 0 {
                let mut noise = vec![0u8; len];
                rand::thread_rng().fill_bytes(&mut noise);
                let mut file = fs::OpenOptions::new().write(true).open(path)?;
                file.write_all(&noise)?;
                file.sync_all()?;
            }
            fs::remove_file(path)?;
            tracing::debug!("Securely deleted temp file {}", path.display());
        }
        self.tracked.lock().remove(path);
        Ok(())
    }

    /// Delete every tracked file. Runs on all pipeline exit paths.
    pub fn cleanup_all(&self) {
        let paths: Vec<PathBuf> = self.tracked.lock().iter().cloned().collect();
        for path in paths {
            if let Err(e) = self.secure_delete(&path) {
                tracing::error!("Failed to clean up temp file {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for TempFileManager {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

/// Snapshot of the resource checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub within_limits: bool,
    pub memory_ok: bool,
    pub memory_used_mb: u64,
    pub cpu_ok: bool,
    pub elapsed_seconds: u64,
    pub files_ok: bool,
    pub open_files: usize,
}

/// Enforces process resource ceilings between pipeline stages
pub struct ResourceGuard {
    config: ResourceConfig,
    system: Mutex<System>,
    pid: Pid,
}

impl ResourceGuard {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    fn memory_used_mb(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_process_specifics(self.pid, ProcessRefreshKind::new().with_memory());
        system
            .process(self.pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0)
    }

    fn open_files(&self) -> usize {
        #[cfg(target_os = "linux")]
        {
            fs::read_dir("/proc/self/fd")
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    /// Check all limits against a stage start time.
    pub fn check(&self, started: Instant) -> ResourceStatus {
        let memory_used_mb = self.memory_used_mb();
        let memory_ok = memory_used_mb <= self.config.max_memory_mb;
        if !memory_ok {
            tracing::warn!(
                "Memory limit exceeded: {}MB > {}MB",
                memory_used_mb,
                self.config.max_memory_mb
            );
        }

        let elapsed = started.elapsed();
        let cpu_ok = elapsed <= self.config.max_cpu_time;
        if !cpu_ok {
            tracing::warn!(
                "Processing time limit exceeded: {:?} > {:?}",
                elapsed,
                self.config.max_cpu_time
            );
        }

        let open_files = self.open_files();
        let files_ok = open_files <= self.config.max_open_files;
        if !files_ok {
            tracing::warn!(
                "Open file limit exceeded: {} > {}",
                open_files,
                self.config.max_open_files
            );
        }

        ResourceStatus {
            within_limits: memory_ok && cpu_ok && files_ok,
            memory_ok,
            memory_used_mb,
            cpu_ok,
            elapsed_seconds: elapsed.as_secs(),
            files_ok,
            open_files,
        }
    }

    /// Map a breached check to the pipeline error it raises.
    pub fn enforce(&self, started: Instant) -> Result<(), ErrorKind> {
        let status = self.check(started);
        if !status.memory_ok {
            return Err(ErrorKind::MemoryExhausted);
        }
        if !status.cpu_ok {
            return Err(ErrorKind::WorkerTimeout);
        }
        if !status.files_ok {
            return Err(ErrorKind::MemoryExhausted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> FileSecurityValidator {
        FileSecurityValidator::new(SecurityConfig::default())
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_clean_text_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "notes.txt", b"plain ordinary notes about nothing");

        let report = validator().validate(&path, Some("text/plain"));
        assert!(report.is_safe, "issues: {:?}", report.issues);
        assert!(report.content_clean);
        assert_eq!(report.detected_type.as_deref(), Some("text/plain"));
        assert!(report.sha256.is_some());
    }

    #[test]
    fn test_dangerous_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "payload.exe", b"MZ binary");

        let report = validator().validate(&path, None);
        assert!(!report.is_safe);
        assert!(report.issues.iter().any(|issue| issue.contains("dangerous file extension")));
    }

    #[test]
    fn test_content_scan_catches_script_markers() {
        let dir = tempfile::tempdir().unwrap();
        for marker in ["<script>alert(1)</script>", "click javascript:run()", "<?php system();"] {
            let path = write_file(&dir, "page.txt", marker.as_bytes());
            let report = validator().validate(&path, None);
            assert!(!report.is_safe, "marker {marker:?} slipped through");
            assert!(!report.content_clean);
        }
    }

    #[test]
    fn test_content_scan_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "page.txt", b"<SCRIPT>payload</SCRIPT>");
        let report = validator().validate(&path, None);
        assert!(!report.content_clean);
    }

    #[test]
    fn test_oversize_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.txt", &vec![b'a'; 1024]);

        let small = FileSecurityValidator::new(SecurityConfig {
            max_file_size_mb: 0,
            ..SecurityConfig::default()
        });
        let report = small.validate(&path, None);
        assert!(!report.size_compliant);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_mime_mismatch_is_soft_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "doc.txt", b"%PDF-1.7 fake pdf body");

        let report = validator().validate(&path, Some("text/plain"));
        // Detected application/pdf, declared text/plain: mismatch noted but
        // the type itself is allowed.
        assert!(report.issues.iter().any(|issue| issue.contains("MIME type mismatch")));
        assert!(report.risk_score >= 0.4);
    }

    #[test]
    fn test_pdf_with_javascript_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"%PDF-1.4\n/Type /Page\n/JavaScript (alert)\n%%EOF";
        let path = write_file(&dir, "evil.pdf", body);

        let report = validator().validate(&path, Some("application/pdf"));
        assert!(!report.is_safe);
        assert!(report.issues.iter().any(|issue| issue.contains("JavaScript")));
    }

    #[test]
    fn test_pdf_page_count_token_matching() {
        let bytes = b"/Type /Page x /Type /Pages x /Type /Page";
        assert_eq!(count_pdf_pages(bytes), 2);
    }

    #[test]
    fn test_secure_temp_file_lifecycle() {
        let manager = TempFileManager::new().unwrap();
        let path = manager.write_temp_file(".txt", b"sensitive content").unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        manager.secure_delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_all_removes_tracked_files() {
        let manager = TempFileManager::new().unwrap();
        let a = manager.write_temp_file(".a", b"one").unwrap();
        let b = manager.write_temp_file(".b", b"two").unwrap();
        manager.cleanup_all();
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_resource_guard_within_limits() {
        let guard = ResourceGuard::new(ResourceConfig {
            max_memory_mb: 1024 * 1024,
            max_cpu_time: std::time::Duration::from_secs(3600),
            max_open_files: 1_000_000,
        });
        assert!(guard.enforce(Instant::now()).is_ok());
    }

    #[test]
    fn test_resource_guard_time_breach() {
        let guard = ResourceGuard::new(ResourceConfig {
            max_memory_mb: 1024 * 1024,
            max_cpu_time: std::time::Duration::from_secs(0),
            max_open_files: 1_000_000,
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(guard.enforce(Instant::now() - std::time::Duration::from_secs(1)), Err(ErrorKind::WorkerTimeout));
    }
}

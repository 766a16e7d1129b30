//! 失败分类
//!
//! 按错误消息匹配规则表，第一条命中的规则决定失败类型。
//! 驱动层和执行器自身的错误消息都会经过这里。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Timeout,
    ElementNotFound,
    TextNotFound,
    ImageNotMatched,
    AssertionFailed,
    AppCrash,
    AppNotRunning,
    SessionError,
    ConnectionError,
    NetworkError,
    PermissionDenied,
    ResourceExhausted,
    CycleDetected,
    Cancelled,
    Unknown,
}

/// 规则表 (顺序即优先级)
const RULES: &[(FailureType, &str)] = &[
    // 等待类动作超时，消息中的选择器或文本不参与匹配
    (FailureType::Timeout, r"^等待(元素|文本|图像)(出现|消失)超时"),
    (FailureType::CycleDetected, r"(?i)检测到循环|cycle detected|\bcycle\b"),
    (
        FailureType::AppCrash,
        r"(?i)应用崩溃|崩溃|无响应|crash|\bANR\b|has stopped|keeps stopping",
    ),
    (
        FailureType::Cancelled,
        r"(?i)操作已停止|执行已取消|已取消|cancell?ed|aborted",
    ),
    (
        FailureType::ElementNotFound,
        r"(?i)元素未找到|no such element|element not found|unable to locate element|could not find element",
    ),
    (
        FailureType::TextNotFound,
        r"(?i)文本未找到|text not found|text .* not (found|visible)",
    ),
    (
        FailureType::ImageNotMatched,
        r"(?i)图像未匹配|image not (found|matched)|template not matched|no match for image",
    ),
    (
        FailureType::AssertionFailed,
        r"(?i)断言失败|assert(ion)? failed|expected .* but (got|was)",
    ),
    (
        FailureType::AppNotRunning,
        r"(?i)应用未运行|app(lication)? (is )?not running|not in foreground",
    ),
    (
        FailureType::SessionError,
        r"(?i)会话错误|invalid session|session (not created|expired|terminated|is closed)",
    ),
    (
        FailureType::PermissionDenied,
        r"(?i)权限不足|permission denied|not permitted|unauthori[sz]ed|security ?exception",
    ),
    (
        FailureType::ResourceExhausted,
        r"(?i)资源耗尽|内存不足|out of memory|\bOOM\b|no space left|too many open files|resource exhausted",
    ),
    (
        FailureType::ConnectionError,
        r"(?i)连接失败|连接断开|connection (refused|reset|closed|lost)|ECONNREFUSED|ECONNRESET|device (offline|disconnected)",
    ),
    (
        FailureType::NetworkError,
        r"(?i)网络|network|dns|host unreachable|socket hang up|ETIMEDOUT",
    ),
    (FailureType::Timeout, r"(?i)超时|timed? ?out"),
];

fn rules() -> &'static [(FailureType, Regex)] {
    static COMPILED: OnceLock<Vec<(FailureType, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (*kind, re)))
            .collect()
    })
}

/// 按错误消息分类
pub fn classify_failure(message: &str) -> FailureType {
    rules()
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(kind, _)| *kind)
        .unwrap_or(FailureType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_actions::ActionError;

    #[test]
    fn test_every_rule_compiles() {
        assert_eq!(rules().len(), RULES.len());
    }

    #[test]
    fn test_classify_corpus() {
        let corpus = [
            ("检测到循环: 节点 a 被重复访问", FailureType::CycleDetected),
            ("Unfortunately, Shop has stopped", FailureType::AppCrash),
            ("ANR in com.example.shop", FailureType::AppCrash),
            ("执行已取消", FailureType::Cancelled),
            ("request was cancelled by user", FailureType::Cancelled),
            ("元素未找到: Id=login", FailureType::ElementNotFound),
            (
                "An element could not be located: no such element",
                FailureType::ElementNotFound,
            ),
            ("文本未找到: 同意", FailureType::TextNotFound),
            ("text '确定' not visible on screen", FailureType::TextNotFound),
            ("图像未匹配: ok.png", FailureType::ImageNotMatched),
            ("image not matched: banner.png", FailureType::ImageNotMatched),
            ("断言失败: 元素 Id=title 文本为 '首页'", FailureType::AssertionFailed),
            ("expected 'Home' but got 'Login'", FailureType::AssertionFailed),
            ("app is not running: com.example", FailureType::AppNotRunning),
            ("invalid session id", FailureType::SessionError),
            ("Session not created: device busy", FailureType::SessionError),
            ("Permission denied (publickey)", FailureType::PermissionDenied),
            ("java.lang.SecurityException: injecting input", FailureType::PermissionDenied),
            ("java.lang.OutOfMemoryError: out of memory", FailureType::ResourceExhausted),
            ("No space left on device", FailureType::ResourceExhausted),
            ("connect ECONNREFUSED 127.0.0.1:4723", FailureType::ConnectionError),
            ("device offline", FailureType::ConnectionError),
            ("getaddrinfo: dns lookup failed", FailureType::NetworkError),
            ("socket hang up", FailureType::NetworkError),
            ("步骤执行超时 (30000ms)", FailureType::Timeout),
            ("等待元素消失超时 (5000ms): Id=spinner", FailureType::Timeout),
            ("等待元素出现超时 (5000ms): Id=login", FailureType::Timeout),
            ("等待文本出现超时 (3000ms): 应用崩溃了", FailureType::Timeout),
            ("等待图像出现超时 (3000ms): network.png", FailureType::Timeout),
            ("等待图像消失超时 (3000ms): loading.png", FailureType::Timeout),
            ("operation timed out", FailureType::Timeout),
            ("something odd happened", FailureType::Unknown),
        ];

        for (message, expected) in corpus {
            assert_eq!(classify_failure(message), expected, "message: {}", message);
        }
    }

    #[test]
    fn test_classify_action_errors() {
        let cases = [
            (ActionError::ElementNotFound("Id=a".into()), FailureType::ElementNotFound),
            (ActionError::ImageNotMatched("a.png".into()), FailureType::ImageNotMatched),
            (ActionError::Timeout("tap".into()), FailureType::Timeout),
            (ActionError::Session("closed".into()), FailureType::SessionError),
            (ActionError::Connection("adb".into()), FailureType::ConnectionError),
            (ActionError::AppNotRunning("shop".into()), FailureType::AppNotRunning),
            (ActionError::AppCrashed("shop".into()), FailureType::AppCrash),
            (ActionError::PermissionDenied("input".into()), FailureType::PermissionDenied),
            (ActionError::Stopped, FailureType::Cancelled),
            (ActionError::Driver("boom".into()), FailureType::Unknown),
        ];

        for (error, expected) in cases {
            assert_eq!(classify_failure(&error.to_string()), expected, "error: {}", error);
        }
    }
}

use std::collections::HashMap;

pub struct I18n {
    translations: HashMap<String, HashMap<String, String>>,
    current_lang: String,
}

impl I18n {
    pub fn new(lang: &str) -> Self {
        let mut translations = HashMap::new();

        // English
        let mut en = HashMap::new();
        // Approval prompts
        en.insert("pending_prompt".to_string(), "⚠️ Dangerous command detected:\n`{0}`\n\nDo you want to run it?".to_string());

        // Responses written for the chat adapter
        en.insert("response_completed".to_string(), "**Command completed**\n`{0}`\n\n".to_string());
        en.insert("response_approved_completed".to_string(), "**Approved command executed**\n`{0}`\n\n".to_string());
        en.insert("response_output".to_string(), "**Output:**\n```\n{0}\n```".to_string());
        en.insert("response_output_truncated".to_string(), "\n*(output truncated to {0} characters)*".to_string());
        en.insert("response_stderr".to_string(), "\n\n**Error output:**\n```\n{0}\n```".to_string());
        en.insert("response_stderr_truncated".to_string(), "\n*(error output truncated to {0} characters)*".to_string());
        en.insert("response_failed".to_string(), "**Command failed**\n`{0}`\n\nError: {1}".to_string());
        en.insert("response_cancelled".to_string(), "Command execution was cancelled.".to_string());
        en.insert("response_cancelled_by".to_string(), "Command execution was cancelled by {0}.".to_string());

        // Execution errors
        en.insert("error_timeout".to_string(), "Command timed out after {0} seconds".to_string());
        en.insert("error_launch".to_string(), "Failed to start command: {0}".to_string());
        en.insert("error_command_changed".to_string(), "The pending command no longer matches what was submitted; refusing to run it".to_string());

        // CLI output
        en.insert("submitted".to_string(), "Command queued as {0}".to_string());
        en.insert("submit_needs_approval".to_string(), "This command needs approval before it runs".to_string());
        en.insert("signal_written".to_string(), "Decision recorded as {0}".to_string());
        en.insert("pending_missing".to_string(), "No pending approval named {0}".to_string());
        en.insert("no_pending".to_string(), "No commands are waiting for approval".to_string());
        en.insert("no_responses".to_string(), "No responses".to_string());
        en.insert("status_title".to_string(), "Mailbox status ({0})".to_string());
        en.insert("status_commands".to_string(), "Queued commands".to_string());
        en.insert("status_responses".to_string(), "Undelivered responses".to_string());
        en.insert("status_pending".to_string(), "Waiting for approval".to_string());
        en.insert("cleaned_files".to_string(), "Removed {0} old file(s)".to_string());
        en.insert("daemon_started".to_string(), "Executor started, watching {0}".to_string());
        en.insert("daemon_stopped".to_string(), "Executor stopped".to_string());
        en.insert("requested_by".to_string(), "requested by {0}".to_string());

        // 日本語
        let mut ja = HashMap::new();
        ja.insert("pending_prompt".to_string(), "⚠️ 危険なコマンドが検出されました:\n`{0}`\n\n実行してもよろしいですか？".to_string());

        ja.insert("response_completed".to_string(), "**コマンド実行完了**\n`{0}`\n\n".to_string());
        ja.insert("response_approved_completed".to_string(), "**承認されたコマンドを実行しました**\n`{0}`\n\n".to_string());
        ja.insert("response_output".to_string(), "**出力:**\n```\n{0}\n```".to_string());
        ja.insert("response_output_truncated".to_string(), "\n*(出力は{0}文字で切り詰められました)*".to_string());
        ja.insert("response_stderr".to_string(), "\n\n**エラー出力:**\n```\n{0}\n```".to_string());
        ja.insert("response_stderr_truncated".to_string(), "\n*(エラー出力は{0}文字で切り詰められました)*".to_string());
        ja.insert("response_failed".to_string(), "**コマンド実行失敗**\n`{0}`\n\nエラー: {1}".to_string());
        ja.insert("response_cancelled".to_string(), "コマンドの実行がキャンセルされました。".to_string());
        ja.insert("response_cancelled_by".to_string(), "{0}がコマンドの実行を拒否しました。".to_string());

        ja.insert("error_timeout".to_string(), "コマンドが{0}秒でタイムアウトしました".to_string());
        ja.insert("error_launch".to_string(), "コマンドを起動できませんでした: {0}".to_string());
        ja.insert("error_command_changed".to_string(), "承認待ちのコマンドが送信内容と一致しないため実行を中止しました".to_string());

        ja.insert("submitted".to_string(), "コマンドを {0} として登録しました".to_string());
        ja.insert("submit_needs_approval".to_string(), "このコマンドは実行前に承認が必要です".to_string());
        ja.insert("signal_written".to_string(), "判断を {0} として記録しました".to_string());
        ja.insert("pending_missing".to_string(), "承認待ち {0} は見つかりません".to_string());
        ja.insert("no_pending".to_string(), "承認待ちのコマンドはありません".to_string());
        ja.insert("no_responses".to_string(), "応答はありません".to_string());
        ja.insert("status_title".to_string(), "メールボックスの状態 ({0})".to_string());
        ja.insert("status_commands".to_string(), "待機中のコマンド".to_string());
        ja.insert("status_responses".to_string(), "未送信の応答".to_string());
        ja.insert("status_pending".to_string(), "承認待ち".to_string());
        ja.insert("cleaned_files".to_string(), "古いファイルを{0}件削除しました".to_string());
        ja.insert("daemon_started".to_string(), "実行エンジンを開始しました: {0}".to_string());
        ja.insert("daemon_stopped".to_string(), "実行エンジンを停止しました".to_string());
        ja.insert("requested_by".to_string(), "依頼者: {0}".to_string());

        translations.insert("en".to_string(), en);
        translations.insert("ja".to_string(), ja);

        let effective_lang = if lang.starts_with("ja") || lang == "jp" || lang == "japanese" {
            "ja"
        } else {
            // English for everything else
            "en"
        };

        Self {
            translations,
            current_lang: effective_lang.to_string(),
        }
    }

    pub fn lang(&self) -> &str {
        &self.current_lang
    }

    pub fn t(&self, key: &str) -> String {
        if let Some(lang_map) = self.translations.get(&self.current_lang) {
            if let Some(value) = lang_map.get(key) {
                return value.clone();
            }
        }
        key.to_string()
    }

    /// Fills `{0}`, `{1}`, ... in one pass; braces inside arguments are left alone.
    pub fn t_format(&self, key: &str, args: &[&str]) -> String {
        let template = self.t(key);
        let mut result = String::with_capacity(template.len());
        let mut rest = template.as_str();

        while let Some(open) = rest.find('{') {
            result.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let arg = after.find('}').and_then(|close| {
                let index: usize = after[..close].parse().ok()?;
                args.get(index).map(|arg| (arg, close))
            });
            match arg {
                Some((arg, close)) => {
                    result.push_str(arg);
                    rest = &after[close + 1..];
                }
                None => {
                    result.push('{');
                    rest = after;
                }
            }
        }
        result.push_str(rest);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_selection() {
        assert_eq!(I18n::new("ja_JP").lang(), "ja");
        assert_eq!(I18n::new("en_US").lang(), "en");
        assert_eq!(I18n::new("fr_FR").lang(), "en");
    }

    #[test]
    fn formats_positional_arguments() {
        let i18n = I18n::new("en");
        assert_eq!(
            i18n.t_format("response_failed", &["ls", "boom"]),
            "**Command failed**\n`ls`\n\nError: boom"
        );
    }

    #[test]
    fn placeholders_inside_arguments_are_not_expanded() {
        let i18n = I18n::new("en");
        assert_eq!(
            i18n.t_format("response_failed", &["echo {1}", "boom"]),
            "**Command failed**\n`echo {1}`\n\nError: boom"
        );
        assert_eq!(i18n.t_format("submitted", &[]), "Command queued as {0}");
    }

    #[test]
    fn unknown_key_falls_back_to_key() {
        assert_eq!(I18n::new("en").t("nope"), "nope");
    }

    #[test]
    fn both_languages_cover_the_same_keys() {
        let i18n = I18n::new("en");
        let en = &i18n.translations["en"];
        let ja = &i18n.translations["ja"];
        let mut missing: Vec<_> = en.keys().filter(|k| !ja.contains_key(*k)).collect();
        missing.sort();
        assert!(missing.is_empty(), "missing ja keys: {missing:?}");
        assert_eq!(en.len(), ja.len());
    }
}

use std::process::{Child, Command, Stdio};

/// Voice parameters handed to the speech backend
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOptions {
    /// Words per minute
    pub rate: u32,
    /// 0-200, backend dependent
    pub volume: u32,
    pub voice: Option<String>,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            rate: 175,
            volume: 100,
            voice: None,
        }
    }
}

/// Speaks operands aloud. Output is monophonic: a new utterance or a cancel
/// silences whatever is still playing.
pub trait Speaker {
    fn speak(&mut self, text: &str, opts: &SpeechOptions);
    fn cancel(&mut self);
}

#[derive(Debug, Default)]
pub struct NoopSpeaker;

impl Speaker for NoopSpeaker {
    fn speak(&mut self, _text: &str, _opts: &SpeechOptions) {}

    fn cancel(&mut self) {}
}

/// Speaks through an external TTS program such as `espeak`
#[derive(Debug)]
pub struct CommandSpeaker {
    program: String,
    current: Option<Child>,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            current: None,
        }
    }

    fn args(text: &str, opts: &SpeechOptions) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            opts.rate.to_string(),
            "-a".to_string(),
            opts.volume.to_string(),
        ];
        if let Some(voice) = &opts.voice {
            args.push("-v".to_string());
            args.push(voice.clone());
        }
        args.push(text.to_string());
        args
    }
}

impl Default for CommandSpeaker {
    fn default() -> Self {
        Self::new("espeak")
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&mut self, text: &str, opts: &SpeechOptions) {
        self.cancel();
        match Command::new(&self.program)
            .args(Self::args(text, opts))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => self.current = Some(child),
            Err(e) => tracing::warn!("speech program {} failed to start: {}", self.program, e),
        }
    }

    fn cancel(&mut self) {
        if let Some(mut child) = self.current.take() {
            // already exited is fine
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for CommandSpeaker {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Text spoken for an operand. Negative operands are read as "minus".
pub fn operand_text(value: i64) -> String {
    if value < 0 {
        format!("minus {}", value.unsigned_abs())
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_text_reads_sign() {
        assert_eq!(operand_text(7), "7");
        assert_eq!(operand_text(-12), "minus 12");
    }

    #[test]
    fn command_args_include_voice() {
        let opts = SpeechOptions {
            voice: Some("en".into()),
            ..SpeechOptions::default()
        };
        let args = CommandSpeaker::args("5", &opts);
        assert_eq!(args, vec!["-s", "175", "-a", "100", "-v", "en", "5"]);
    }

    #[test]
    fn missing_program_does_not_panic() {
        let mut speaker = CommandSpeaker::new("definitely-not-a-tts-program-anzan");
        speaker.speak("1", &SpeechOptions::default());
        assert!(speaker.current.is_none());
        speaker.cancel();
    }
}

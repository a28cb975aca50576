use crate::error::{AgentError, Result};
use chrono::DateTime;
use pushprobe_core::{Clock, Commander};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// APK of the receiver app the probes target
const TARGET_APK: &str = "target-app/app-debug.apk";
/// Activity launched after install
const TARGET_COMPONENT: &str =
    "com.pushprobe.target/com.pushprobe.target.MainActivity";
/// Seconds between device-token polls
const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the local emulator, the target app, and the receipt sink.
///
/// Everything here is an external collaborator reached through the command
/// port: the emulator toolchain, `adb`, and the `receive` script that reads
/// delivery receipts the app wrote.
pub struct DeviceHandler {
    commander: Arc<dyn Commander>,
    clock: Arc<dyn Clock>,
}

impl DeviceHandler {
    pub fn new(commander: Arc<dyn Commander>, clock: Arc<dyn Clock>) -> Self {
        Self { commander, clock }
    }

    /// Pick the first configured virtual device.
    pub async fn find_device(&self) -> Result<String> {
        let out = self.commander.output("emulator", &["-list-avds"]).await?;
        let device = out.lines().next().unwrap_or_default().to_string();
        Ok(device)
    }

    /// Boot the emulator and wait for the device to come up.
    pub async fn start_emulator(&self) -> Result<()> {
        let device = self.find_device().await?;
        info!("Starting emulator for device {}", device);
        self.commander
            .spawn(
                "emulator",
                &[
                    "-avd",
                    &device,
                    "-no-snapshot",
                    "-no-window",
                    "-no-audio",
                    "-delay-adb",
                ],
            )
            .await?;
        self.commander.run("adb", &["wait-for-device"]).await?;
        Ok(())
    }

    /// Install and launch the target app.
    pub async fn start_app(&self) -> Result<()> {
        self.commander.run("adb", &["install", TARGET_APK]).await?;
        self.commander
            .run("adb", &["shell", "am", "start", "-n", TARGET_COMPONENT])
            .await?;
        Ok(())
    }

    pub async fn uninstall_app(&self) -> Result<()> {
        self.commander
            .run("adb", &["uninstall", "com.pushprobe.target"])
            .await?;
        Ok(())
    }

    pub async fn kill_emulator(&self) -> Result<()> {
        self.commander.run("adb", &["emu", "kill"]).await?;
        Ok(())
    }

    /// Poll the token file until the app has produced its device token.
    pub async fn device_token(&self, retries: u32) -> Result<String> {
        for _ in 0..retries {
            let token = self
                .commander
                .output("bash", &["receive", "token.txt"])
                .await?;
            if token != "nf" {
                return Ok(token);
            }
            tokio::time::sleep(TOKEN_POLL_INTERVAL).await;
        }
        Err(AgentError::TokenTimeout)
    }

    /// Read one receipt file from the sink; the body is either `nf` or the
    /// device-side arrival time in epoch milliseconds.
    pub async fn receipt(&self, file_name: &str) -> Result<String> {
        let file = format!("{}.txt", file_name);
        self.commander
            .output("bash", &["receive", &file, "-p", "logs/"])
            .await
            .map_err(Into::into)
    }

    /// Measure the offset between the host clock and the device clock,
    /// corrected by half the round-trip time of the query.
    pub async fn time_offset(&self) -> Result<i64> {
        let before = self.clock.now();
        let out = self
            .commander
            .output("adb", &["shell", "echo $EPOCHREALTIME"])
            .await?;
        let after = self.clock.now();

        let device_time = parse_device_time(out.trim_end_matches('\n'))?;
        let half_rtt = (after - before).num_milliseconds() / 2;
        let offset = (after - device_time).num_milliseconds() - half_rtt;
        debug!("Device clock offset is {}ms", offset);
        Ok(offset)
    }
}

/// Parse the device's `seconds.microseconds` clock reading.
fn parse_device_time(raw: &str) -> Result<DateTime<chrono::Utc>> {
    let (secs, micros) = raw
        .split_once('.')
        .ok_or_else(|| AgentError::device_time(raw))?;
    let secs: i64 = secs
        .parse()
        .map_err(|_| AgentError::device_time(raw))?;
    let micros: i64 = micros
        .parse()
        .map_err(|_| AgentError::device_time(raw))?;
    if !(0..1_000_000).contains(&micros) {
        return Err(AgentError::device_time(raw));
    }
    DateTime::from_timestamp(secs, micros as u32 * 1000)
        .ok_or_else(|| AgentError::device_time(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushprobe_core::fake::{FakeClock, FakeCommander};

    #[tokio::test]
    async fn test_find_device_picks_first() {
        let commander = Arc::new(FakeCommander::scripted(
            &[("TEST_DEVICE_1\nTEST_DEVICE_2\nTEST_DEVICE_3", false)],
            false,
        ));
        let handler = DeviceHandler::new(commander, Arc::new(FakeClock::at_secs(&[0], true)));

        assert_eq!(handler.find_device().await.unwrap(), "TEST_DEVICE_1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_token_polls_until_found() {
        let commander = Arc::new(FakeCommander::scripted(
            &[("nf", false), ("nf", false), ("DEVICE_TOKEN", false)],
            false,
        ));
        let handler = DeviceHandler::new(commander, Arc::new(FakeClock::at_secs(&[0], true)));

        assert_eq!(handler.device_token(5).await.unwrap(), "DEVICE_TOKEN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_token_times_out() {
        let commander = Arc::new(FakeCommander::scripted(&[("nf", false)], true));
        let handler = DeviceHandler::new(commander, Arc::new(FakeClock::at_secs(&[0], true)));

        let result = handler.device_token(3).await;
        assert!(matches!(result.unwrap_err(), AgentError::TokenTimeout));
    }

    #[tokio::test]
    async fn test_device_token_propagates_command_failure() {
        let commander = Arc::new(FakeCommander::scripted(&[("no sink", true)], false));
        let handler = DeviceHandler::new(commander, Arc::new(FakeClock::at_secs(&[0], true)));

        let result = handler.device_token(3).await;
        assert!(matches!(result.unwrap_err(), AgentError::CoreError(_)));
    }

    #[tokio::test]
    async fn test_time_offset_subtracts_half_rtt() {
        // Host reads 100s before and 102s after; device reports 100s, so the
        // raw skew of 2000ms shrinks by the 1000ms half round trip.
        let commander = Arc::new(FakeCommander::scripted(&[("100.000000\n", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[100, 102], false));
        let handler = DeviceHandler::new(commander, clock);

        assert_eq!(handler.time_offset().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_time_offset_zero_when_clocks_agree() {
        let commander = Arc::new(FakeCommander::scripted(&[("100.000000\n", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[100, 100], false));
        let handler = DeviceHandler::new(commander, clock);

        assert_eq!(handler.time_offset().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_time_offset_rejects_malformed_reading() {
        let commander = Arc::new(FakeCommander::scripted(&[("garbage", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[100, 100], false));
        let handler = DeviceHandler::new(commander, clock);

        let result = handler.time_offset().await;
        assert!(matches!(result.unwrap_err(), AgentError::DeviceTime { .. }));
    }

    #[tokio::test]
    async fn test_receipt_queries_log_directory() {
        let commander = Arc::new(FakeCommander::scripted(&[("1000", false)], false));
        let handler =
            DeviceHandler::new(commander.clone(), Arc::new(FakeClock::at_secs(&[0], true)));

        let body = handler.receipt("02020-06-01-T123456.789+0000").await.unwrap();

        assert_eq!(body, "1000");
        assert_eq!(
            commander.invocations()[0],
            "bash receive 02020-06-01-T123456.789+0000.txt -p logs/"
        );
    }
}

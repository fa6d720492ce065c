// serial.rs — P1 port reception + telegram pipeline

use crate::*;

/// Chunk size for draining the UART driver's receive buffer.
const READ_CHUNK_SIZE: usize = 256;
/// Idle poll interval; the driver's receive ring holds several polls'
/// worth of data at 115200 baud.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Drain the P1 port, assemble telegrams and commit every valid one to the
/// shared state. Framing and CRC errors cost the broken frame, nothing
/// else; the loop itself only fails on a driver error.
pub async fn read_p1(state: Arc<Pin<Box<MyState>>>, port: uart::UartRxDriver<'_>) -> AppResult<()> {
    let mut assembler = TelegramAssembler::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut parsed: Vec<P1Data> = Vec::new();

    info!("P1 reader running.");
    loop {
        // Zero-wait read; the driver buffers between polls.
        let n = port.read(&mut chunk, 0)?;
        if n == 0 {
            sleep(POLL_INTERVAL).await;
            continue;
        }

        assembler.feed(&chunk[..n], |telegram| {
            if let Some(data) = parse_telegram(telegram) {
                parsed.push(data);
            }
        });

        for data in parsed.drain(..) {
            debug!("P1 telegram committed, meter time {}", data.msg_timestamp);
            state.meter.commit_telegram(data).await;
        }
    }
}
// EOF

/// Capabilities and tuning of one host instance.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// The internal DMA controller is usable
    pub dma: bool,
    /// Only DAT0 is wired
    pub width_d1_only: bool,

    pub clkdiv_init: u32,
    pub clkdiv_mmc_xfr: u32,
    pub clkdiv_sd_wide_xfr: u32,
    pub clkdiv_sd_xfr: u32,

    pub fifo_depth_words: usize,
    pub fifo_rx_watermark: u32,
    pub fifo_tx_watermark: u32,

    pub cmd_accept_timeout_us: u64,
    pub short_response_timeout_us: u64,
    pub long_response_timeout_us: u64,
    pub reset_timeout_us: u64,

    pub dma_desc_len: usize,
    pub dma_max_descs: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            dma: true,
            width_d1_only: false,
            clkdiv_init: 6,
            clkdiv_mmc_xfr: 102,
            clkdiv_sd_wide_xfr: 5,
            clkdiv_sd_xfr: 102,
            fifo_depth_words: 32,
            fifo_rx_watermark: 15,
            fifo_tx_watermark: 16,
            cmd_accept_timeout_us: 10_000,
            short_response_timeout_us: 10_000,
            long_response_timeout_us: 1_000_000,
            reset_timeout_us: 10_000,
            dma_desc_len: 512,
            dma_max_descs: super::dma::MAX_DMA_DESCS,
        }
    }
}

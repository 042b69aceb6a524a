use serde::{Deserialize, Serialize};

/// An order as the remote reports it. Plots are fetched through the same
/// endpoint but decoded separately. The documented response carries only
/// the plot list, so the id is optional and empty when absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderRecord {
    #[serde(default, alias = "ID")]
    pub id: String,
}

/// The flat plot schema shared by every plot-returning endpoint:
/// one-letter lifecycle code, plotting progress and the download URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlotRecord {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(default, alias = "Progress")]
    pub progress: u8,
    #[serde(default, alias = "URL")]
    pub url: String,
    #[serde(default, alias = "State")]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderPlotsResponse {
    #[serde(default, alias = "Plots")]
    pub plots: Vec<PlotRecord>,
}

/// Body of the PUT that marks a plot expired. `DownloadState: 2` is the
/// remote's code for "downloaded".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpirePlotRequest {
    pub id: String,
    pub state: String,
    #[serde(rename = "DownloadState")]
    pub download_state: u8,
}
